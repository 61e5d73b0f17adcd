//! Aggregate statistics, trigger-driven snapshots and time series.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::population::ChainPopulation;

/// Number/weight averages of a chain-length distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub chains: u64,
    pub mn: f64,
    pub mw: f64,
    pub dispersity: f64,
}

impl Statistics {
    /// Builds the averages from the zeroth, first and second moments.
    pub fn from_moments(chains: u64, dp_sum: u64, dp_sq_sum: u128) -> Self {
        if chains == 0 || dp_sum == 0 {
            return Self::default();
        }
        let mn = dp_sum as f64 / chains as f64;
        let mw = dp_sq_sum as f64 / dp_sum as f64;
        Self {
            chains,
            mn,
            mw,
            dispersity: mw / mn,
        }
    }

    pub fn from_lengths(lengths: &[u64]) -> Self {
        Self::from_lengths_with_min_dp(lengths, 0)
    }

    /// Same as [`Statistics::from_lengths`] but ignores chains shorter than
    /// `min_dp`, e.g. oligomers left over from late initiation.
    pub fn from_lengths_with_min_dp(lengths: &[u64], min_dp: u64) -> Self {
        let (chains, sum, sq_sum) = lengths
            .iter()
            .filter(|&&dp| dp >= min_dp)
            .fold((0u64, 0u64, 0u128), |(n, s, q), &dp| {
                (n + 1, s + dp, q + dp as u128 * dp as u128)
            });
        Self::from_moments(chains, sum, sq_sum)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    /// Running Mn crossed this target DP.
    Target(f64),
    /// Conversion crossed this checkpoint.
    Conversion(f64),
    /// Taken when the run terminated.
    Final,
    /// Taken on demand by the caller.
    Requested,
}

/// Immutable record of the population at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub trigger: SnapshotTrigger,
    pub time: f64,
    pub events: u64,
    pub conversion: f64,
    pub stats: Statistics,
    /// Unreacted monomer.
    pub monomer: u64,
    pub introduced_monomer: u64,
    /// DP of every chain in creation order.
    pub chain_lengths: Vec<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversionPoint {
    pub time: f64,
    pub conversion: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MolecularWeightPoint {
    pub time: f64,
    pub mn: f64,
    pub mw: f64,
}

/// Append-only (time, conversion) and (time, Mn, Mw) records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub conversion: Vec<ConversionPoint>,
    pub molecular_weight: Vec<MolecularWeightPoint>,
}

impl TimeSeries {
    fn push(&mut self, time: f64, conversion: f64, stats: &Statistics) {
        self.conversion.push(ConversionPoint { time, conversion });
        self.molecular_weight.push(MolecularWeightPoint {
            time,
            mn: stats.mn,
            mw: stats.mw,
        });
    }
}

/// Borrowed view of the engine state handed to the reporter.
#[derive(Clone, Copy, Debug)]
pub struct Observation<'a> {
    pub time: f64,
    pub events: u64,
    pub conversion: f64,
    pub monomer: u64,
    pub introduced_monomer: u64,
    pub population: &'a ChainPopulation,
}

impl Observation<'_> {
    pub fn statistics(&self) -> Statistics {
        Statistics::from_moments(
            self.population.chain_count(),
            self.population.dp_sum(),
            self.population.dp_sq_sum(),
        )
    }

    pub fn snapshot(&self, trigger: SnapshotTrigger) -> Snapshot {
        Snapshot {
            trigger,
            time: self.time,
            events: self.events,
            conversion: self.conversion,
            stats: self.statistics(),
            monomer: self.monomer,
            introduced_monomer: self.introduced_monomer,
            chain_lengths: self.population.snapshot(),
        }
    }
}

/// Watches the running statistics and emits snapshots the first time each
/// target or checkpoint is crossed.
#[derive(Clone, Debug)]
pub struct Reporter {
    targets: Vec<f64>,
    next_target: usize,
    checkpoints: Vec<f64>,
    next_checkpoint: usize,
    sample_times: Vec<f64>,
    next_sample: usize,
    snapshots: Vec<Snapshot>,
    series: TimeSeries,
}

impl Reporter {
    pub fn new(config: &SimulationConfig) -> Self {
        let mut checkpoints = config.conversion_checkpoints.clone();
        checkpoints.sort_by(f64::total_cmp);
        checkpoints.dedup();
        Self {
            targets: config.sorted_targets(),
            next_target: 0,
            checkpoints,
            next_checkpoint: 0,
            sample_times: config.sample_times.clone(),
            next_sample: 0,
            snapshots: Vec::new(),
            series: TimeSeries::default(),
        }
    }

    /// Emits a snapshot for every target and checkpoint crossed by the
    /// current state. Returns how many were emitted.
    pub fn observe(&mut self, obs: &Observation<'_>) -> usize {
        let before = self.snapshots.len();
        let mn = obs.population.number_average();
        while let Some(&target) = self.targets.get(self.next_target) {
            if mn < target {
                break;
            }
            self.next_target += 1;
            debug!(
                target_dp = target,
                mn,
                time = obs.time,
                events = obs.events,
                "Target DP reached"
            );
            self.push(obs.snapshot(SnapshotTrigger::Target(target)));
        }
        while let Some(&checkpoint) = self.checkpoints.get(self.next_checkpoint) {
            if obs.conversion < checkpoint {
                break;
            }
            self.next_checkpoint += 1;
            debug!(
                checkpoint,
                time = obs.time,
                events = obs.events,
                "Conversion checkpoint reached"
            );
            self.push(obs.snapshot(SnapshotTrigger::Conversion(checkpoint)));
        }
        self.snapshots.len() - before
    }

    /// Records every sample time strictly before `time` with the state in
    /// `obs`, which holds on the whole interval up to `time`.
    pub fn record_samples_before(&mut self, time: f64, obs: &Observation<'_>) {
        self.record_samples(obs, |t| t < time);
    }

    /// Like [`Reporter::record_samples_before`] but includes `time` itself.
    pub fn record_samples_through(&mut self, time: f64, obs: &Observation<'_>) {
        self.record_samples(obs, |t| t <= time);
    }

    fn record_samples(&mut self, obs: &Observation<'_>, due: impl Fn(f64) -> bool) {
        let mut stats = None;
        while let Some(&t) = self.sample_times.get(self.next_sample) {
            if !due(t) {
                break;
            }
            let stats = *stats.get_or_insert_with(|| obs.statistics());
            self.series.push(t, obs.conversion, &stats);
            self.next_sample += 1;
        }
    }

    #[inline]
    pub fn targets_reached(&self) -> bool {
        self.next_target >= self.targets.len()
    }

    pub fn highest_target(&self) -> Option<f64> {
        self.targets.last().copied()
    }

    /// Appends the final snapshot.
    pub fn finish(&mut self, obs: &Observation<'_>) {
        self.record_samples_through(obs.time, obs);
        self.push(obs.snapshot(SnapshotTrigger::Final));
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn series(&self) -> &TimeSeries {
        &self.series
    }

    pub fn into_parts(self) -> (Vec<Snapshot>, TimeSeries) {
        (self.snapshots, self.series)
    }

    fn push(&mut self, snapshot: Snapshot) {
        self.series
            .push(snapshot.time, snapshot.conversion, &snapshot.stats);
        self.snapshots.push(snapshot);
    }
}

/// Fixed-width histogram of chain lengths. Bin `i` covers DP values in
/// `[i * bin_width, (i + 1) * bin_width)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ChainLengthHistogram {
    bin_width: u64,
    counts: Vec<u64>,
    weights: Vec<u64>,
}

impl ChainLengthHistogram {
    pub fn new(lengths: &[u64], bin_width: u64) -> Result<Self, SimError> {
        if bin_width == 0 {
            return Err(SimError::Config("histogram bin width must be positive".into()));
        }
        let bins = lengths
            .iter()
            .max()
            .map_or(0, |&max| (max / bin_width) as usize + 1);
        let mut counts = vec![0u64; bins];
        let mut weights = vec![0u64; bins];
        for &dp in lengths {
            let bin = (dp / bin_width) as usize;
            counts[bin] += 1;
            weights[bin] += dp;
        }
        Ok(Self {
            bin_width,
            counts,
            weights,
        })
    }

    pub fn bin_width(&self) -> u64 {
        self.bin_width
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        (bin as f64 + 0.5) * self.bin_width as f64
    }

    /// Weight fraction density per bin; integrates to one over DP.
    pub fn weight_fractions(&self) -> Vec<f64> {
        let total: u64 = self.weights.iter().sum();
        if total == 0 {
            return vec![0.0; self.weights.len()];
        }
        let norm = total as f64 * self.bin_width as f64;
        self.weights.iter().map(|&w| w as f64 / norm).collect()
    }

    /// Bins holding a local maximum of the number histogram with at least
    /// `min_count` chains. A flat top counts once, at its middle bin.
    pub fn local_maxima(&self, min_count: u64) -> Vec<usize> {
        let counts = &self.counts;
        let mut maxima = Vec::new();
        let mut start = 0;
        while start < counts.len() {
            let value = counts[start];
            let mut end = start;
            while end + 1 < counts.len() && counts[end + 1] == value {
                end += 1;
            }
            let left = if start == 0 { 0 } else { counts[start - 1] };
            let right = counts.get(end + 1).copied().unwrap_or(0);
            if value >= min_count && value > left && value > right {
                maxima.push((start + end) / 2);
            }
            start = end + 1;
        }
        maxima
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn statistics_of_uniform_population_are_monodisperse() {
        let stats = Statistics::from_lengths(&[20, 20, 20, 20]);
        assert_eq!(stats.chains, 4);
        assert_relative_eq!(stats.mn, 20.0);
        assert_relative_eq!(stats.mw, 20.0);
        assert_relative_eq!(stats.dispersity, 1.0);
    }

    #[test]
    fn statistics_of_mixed_population() {
        let stats = Statistics::from_lengths(&[1, 3]);
        assert_relative_eq!(stats.mn, 2.0);
        assert_relative_eq!(stats.mw, 10.0 / 4.0);
        assert_relative_eq!(stats.dispersity, 1.25);
    }

    #[test]
    fn empty_population_gives_zero_statistics() {
        assert_eq!(Statistics::from_lengths(&[]), Statistics::default());
    }

    #[test]
    fn low_dp_cutoff_drops_short_chains() {
        let stats = Statistics::from_lengths_with_min_dp(&[1, 2, 10, 10], 3);
        assert_eq!(stats.chains, 2);
        assert_relative_eq!(stats.mn, 10.0);
    }

    fn grown(population: &mut ChainPopulation, dp: u64) {
        let id = population.create_chain();
        for _ in 1..dp {
            population.grow(id).unwrap();
        }
    }

    fn observation(population: &ChainPopulation, time: f64, conversion: f64) -> Observation<'_> {
        Observation {
            time,
            events: 0,
            conversion,
            monomer: 0,
            introduced_monomer: population.dp_sum(),
            population,
        }
    }

    #[test]
    fn targets_fire_once_in_ascending_order() {
        let config = SimulationConfig::new(100, 1, 10.0).with_targets(vec![10.0, 5.0]);
        let mut reporter = Reporter::new(&config);
        let mut population = ChainPopulation::new();
        grown(&mut population, 7);
        assert_eq!(reporter.observe(&observation(&population, 1.0, 0.1)), 1);
        assert_eq!(reporter.observe(&observation(&population, 2.0, 0.1)), 0);
        assert!(!reporter.targets_reached());
        let id = 0;
        for _ in 0..5 {
            population.grow(id).unwrap();
        }
        assert_eq!(reporter.observe(&observation(&population, 3.0, 0.1)), 1);
        assert!(reporter.targets_reached());
        let triggers: Vec<_> = reporter.snapshots().iter().map(|s| s.trigger).collect();
        assert_eq!(
            triggers,
            vec![SnapshotTrigger::Target(5.0), SnapshotTrigger::Target(10.0)]
        );
    }

    #[test]
    fn checkpoints_and_snapshots_feed_time_series() {
        let config = SimulationConfig::new(100, 1, 1000.0)
            .with_conversion_checkpoints(vec![0.5, 0.25])
            .with_sample_times(vec![0.5, 1.0, 2.0]);
        let mut reporter = Reporter::new(&config);
        let mut population = ChainPopulation::new();
        grown(&mut population, 4);
        let obs = observation(&population, 1.5, 0.3);
        reporter.record_samples_before(1.5, &obs);
        assert_eq!(reporter.observe(&obs), 1);
        reporter.finish(&observation(&population, 3.0, 0.6));
        let series = reporter.series();
        let times: Vec<f64> = series.conversion.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![0.5, 1.0, 1.5, 2.0, 3.0]);
        assert_eq!(reporter.snapshots().len(), 2);
        assert_eq!(reporter.last_snapshot().map(|s| s.trigger), Some(SnapshotTrigger::Final));
    }

    #[test]
    fn histogram_counts_and_weights() {
        let hist = ChainLengthHistogram::new(&[1, 5, 9, 10, 25], 10).unwrap();
        assert_eq!(hist.counts(), &[3, 1, 1]);
        assert_relative_eq!(hist.bin_center(1), 15.0);
        let area: f64 = hist.weight_fractions().iter().map(|w| w * 10.0).sum();
        assert_relative_eq!(area, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn histogram_rejects_zero_width() {
        assert!(ChainLengthHistogram::new(&[1, 2], 0).is_err());
    }

    #[test]
    fn local_maxima_handle_plateaus_and_thresholds() {
        let hist = ChainLengthHistogram {
            bin_width: 1,
            counts: vec![5, 1, 0, 4, 4, 4, 2, 3, 1],
            weights: vec![0; 9],
        };
        assert_eq!(hist.local_maxima(1), vec![0, 4, 7]);
        assert_eq!(hist.local_maxima(4), vec![0, 4]);
    }
}
