//! Run configuration.
//!
//! A [`SimulationConfig`] fully defines one run: initial charge, rate
//! constants, dosing schedule, reporting triggers, seed and ceilings. It is a
//! plain value, so any number of configurations can coexist and run
//! independently.

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Conversion at which a run is considered complete.
pub const DEFAULT_CONVERSION_LIMIT: f64 = 0.999;

/// Rate constants of the reaction channels. Initiation and propagation must be
/// positive; the termination and transfer channels may be switched off with 0.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateConstants {
    pub initiation: f64,
    pub propagation: f64,
    #[serde(default)]
    pub combination: f64,
    #[serde(default)]
    pub disproportionation: f64,
    #[serde(default)]
    pub transfer: f64,
}

impl Default for RateConstants {
    /// Fast initiation with no termination: a living-like system.
    fn default() -> Self {
        Self {
            initiation: 100.0,
            propagation: 1.0,
            combination: 0.0,
            disproportionation: 0.0,
            transfer: 0.0,
        }
    }
}

impl RateConstants {
    fn validate(&self) -> Result<(), SimError> {
        for (name, value) in [
            ("initiation", self.initiation),
            ("propagation", self.propagation),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::Config(format!(
                    "{name} rate constant must be positive and finite, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("combination", self.combination),
            ("disproportionation", self.disproportionation),
            ("transfer", self.transfer),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(SimError::Config(format!(
                    "{name} rate constant must be non-negative and finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseTrigger {
    /// Fires when the simulated clock reaches this time.
    Time(f64),
    /// Fires once conversion reaches this fraction.
    Conversion(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoseEntry {
    pub trigger: DoseTrigger,
    pub monomer: u64,
    #[serde(default)]
    pub initiator: u64,
}

impl DoseEntry {
    pub fn at_time(time: f64, monomer: u64) -> Self {
        Self {
            trigger: DoseTrigger::Time(time),
            monomer,
            initiator: 0,
        }
    }

    pub fn at_conversion(conversion: f64, monomer: u64) -> Self {
        Self {
            trigger: DoseTrigger::Conversion(conversion),
            monomer,
            initiator: 0,
        }
    }

    pub fn with_initiator(mut self, initiator: u64) -> Self {
        self.initiator = initiator;
        self
    }
}

/// Named feeding recipes that expand into explicit dose entries.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePreset {
    /// Everything is charged at time zero.
    Single,
    /// `count` equal pulses; the first lands at time zero and each following
    /// gap is `growth` times the previous one, starting from `first_interval`.
    Pulses {
        count: u32,
        first_interval: f64,
        growth: f64,
    },
    /// Two pulses `separation` apart, the first carrying `first_fraction` of
    /// the charge.
    Bimodal {
        first_fraction: f64,
        separation: f64,
    },
}

impl SchedulePreset {
    /// Splits a total monomer/initiator charge into time-triggered doses.
    pub fn expand(&self, monomer: u64, initiator: u64) -> Result<Vec<DoseEntry>, SimError> {
        match *self {
            SchedulePreset::Single => Ok(vec![
                DoseEntry::at_time(0.0, monomer).with_initiator(initiator),
            ]),
            SchedulePreset::Pulses {
                count,
                first_interval,
                growth,
            } => {
                if count == 0 {
                    return Err(SimError::Config("pulse count must be at least 1".into()));
                }
                if !(first_interval > 0.0 && growth >= 1.0) {
                    return Err(SimError::Config(
                        "pulse intervals must be positive and non-shrinking".into(),
                    ));
                }
                let monomer_parts = split_evenly(monomer, count);
                let initiator_parts = split_evenly(initiator, count);
                let mut time = 0.0;
                let mut gap = first_interval;
                let mut doses = Vec::with_capacity(count as usize);
                for (m, i) in monomer_parts.into_iter().zip(initiator_parts) {
                    doses.push(DoseEntry::at_time(time, m).with_initiator(i));
                    time += gap;
                    gap *= growth;
                }
                Ok(doses)
            }
            SchedulePreset::Bimodal {
                first_fraction,
                separation,
            } => {
                if !(first_fraction > 0.0 && first_fraction < 1.0) || separation <= 0.0 {
                    return Err(SimError::Config(
                        "bimodal preset needs 0 < first_fraction < 1 and a positive separation"
                            .into(),
                    ));
                }
                let first_m = (monomer as f64 * first_fraction).round() as u64;
                let first_i = (initiator as f64 * first_fraction).round() as u64;
                Ok(vec![
                    DoseEntry::at_time(0.0, first_m).with_initiator(first_i),
                    DoseEntry::at_time(separation, monomer - first_m)
                        .with_initiator(initiator - first_i),
                ])
            }
        }
    }
}

fn split_evenly(total: u64, parts: u32) -> Vec<u64> {
    let parts = parts as u64;
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| base + u64::from(i < remainder))
        .collect()
}

/// Complete description of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub initial_monomer: u64,
    pub initial_initiator: u64,
    pub rates: RateConstants,
    #[serde(default)]
    pub dosing: Vec<DoseEntry>,
    /// Number-average DP targets; each crossing produces one snapshot.
    pub target_dp: Vec<f64>,
    #[serde(default)]
    pub conversion_checkpoints: Vec<f64>,
    /// Clock values at which time-series points are recorded.
    #[serde(default)]
    pub sample_times: Vec<f64>,
    #[serde(default)]
    pub seed: u64,
    /// Event ceiling; unbounded when absent.
    #[serde(default)]
    pub max_events: Option<u64>,
    /// Simulated-time ceiling; unbounded when absent.
    #[serde(default)]
    pub max_time: Option<f64>,
    #[serde(default = "default_conversion_limit")]
    pub conversion_limit: f64,
}

fn default_conversion_limit() -> f64 {
    DEFAULT_CONVERSION_LIMIT
}

impl SimulationConfig {
    pub fn new(initial_monomer: u64, initial_initiator: u64, target_dp: f64) -> Self {
        Self {
            initial_monomer,
            initial_initiator,
            rates: RateConstants::default(),
            dosing: Vec::new(),
            target_dp: vec![target_dp],
            conversion_checkpoints: Vec::new(),
            sample_times: Vec::new(),
            seed: 12345,
            max_events: None,
            max_time: None,
            conversion_limit: DEFAULT_CONVERSION_LIMIT,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SimError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SimError::Config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String, SimError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SimError::Config(format!("cannot serialize configuration: {e}")))
    }

    pub fn with_rates(mut self, rates: RateConstants) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_dosing(mut self, dosing: Vec<DoseEntry>) -> Self {
        self.dosing = dosing;
        self
    }

    /// Moves the whole initial charge into the doses produced by `preset`.
    pub fn with_preset(mut self, preset: SchedulePreset) -> Result<Self, SimError> {
        self.dosing = preset.expand(self.initial_monomer, self.initial_initiator)?;
        self.initial_monomer = 0;
        self.initial_initiator = 0;
        Ok(self)
    }

    pub fn with_targets(mut self, targets: Vec<f64>) -> Self {
        self.target_dp = targets;
        self
    }

    pub fn with_conversion_checkpoints(mut self, checkpoints: Vec<f64>) -> Self {
        self.conversion_checkpoints = checkpoints;
        self
    }

    pub fn with_sample_times(mut self, times: Vec<f64>) -> Self {
        self.sample_times = times;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    pub fn with_max_time(mut self, max_time: f64) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Monomer charged initially plus every scheduled dose.
    pub fn planned_monomer(&self) -> Result<u64, SimError> {
        self.dosing
            .iter()
            .try_fold(self.initial_monomer, |acc, d| acc.checked_add(d.monomer))
            .ok_or_else(|| SimError::Config("total monomer charge overflows u64".into()))
    }

    /// Initiator charged initially plus every scheduled dose.
    pub fn planned_initiator(&self) -> Result<u64, SimError> {
        self.dosing
            .iter()
            .try_fold(self.initial_initiator, |acc, d| acc.checked_add(d.initiator))
            .ok_or_else(|| SimError::Config("total initiator charge overflows u64".into()))
    }

    /// Targets in the order they are checked.
    pub fn sorted_targets(&self) -> Vec<f64> {
        let mut targets = self.target_dp.clone();
        targets.sort_by(f64::total_cmp);
        targets.dedup();
        targets
    }

    pub fn validate(&self) -> Result<(), SimError> {
        self.rates.validate()?;
        if self.planned_monomer()? == 0 {
            return Err(SimError::Config(
                "no monomer is charged initially or by any dose".into(),
            ));
        }
        if self.planned_initiator()? == 0 {
            return Err(SimError::Config(
                "no initiator is charged initially or by any dose".into(),
            ));
        }
        if self.target_dp.is_empty() {
            return Err(SimError::Config("target DP set is empty".into()));
        }
        if let Some(bad) = self
            .target_dp
            .iter()
            .find(|t| !(t.is_finite() && **t >= 1.0))
        {
            return Err(SimError::Config(format!(
                "target DP values must be finite and at least 1, got {bad}"
            )));
        }
        if let Some(bad) = self
            .conversion_checkpoints
            .iter()
            .find(|c| !(**c > 0.0 && **c <= 1.0))
        {
            return Err(SimError::Config(format!(
                "conversion checkpoints must lie in (0, 1], got {bad}"
            )));
        }
        if self.sample_times.windows(2).any(|w| w[0] > w[1])
            || self.sample_times.iter().any(|t| !(t.is_finite() && *t >= 0.0))
        {
            return Err(SimError::Config(
                "sample times must be finite, non-negative and ascending".into(),
            ));
        }
        if !(self.conversion_limit > 0.0 && self.conversion_limit <= 1.0) {
            return Err(SimError::Config(format!(
                "conversion limit must lie in (0, 1], got {}",
                self.conversion_limit
            )));
        }
        if self.max_events == Some(0) || self.max_time.is_some_and(|t| !(t > 0.0)) {
            return Err(SimError::Config(
                "event and time ceilings must be positive".into(),
            ));
        }
        self.validate_dosing()
    }

    fn validate_dosing(&self) -> Result<(), SimError> {
        let mut last_time = f64::NEG_INFINITY;
        let mut last_conversion = f64::NEG_INFINITY;
        for (idx, dose) in self.dosing.iter().enumerate() {
            if dose.monomer == 0 && dose.initiator == 0 {
                return Err(SimError::Config(format!("dose {idx} adds nothing")));
            }
            match dose.trigger {
                DoseTrigger::Time(t) => {
                    if !(t.is_finite() && t >= 0.0) {
                        return Err(SimError::Config(format!(
                            "dose {idx} time must be finite and non-negative, got {t}"
                        )));
                    }
                    if t < last_time {
                        return Err(SimError::Config(format!(
                            "dose {idx} at time {t} is scheduled before an earlier time dose"
                        )));
                    }
                    last_time = t;
                }
                DoseTrigger::Conversion(c) => {
                    if !(c >= 0.0 && c < 1.0) {
                        return Err(SimError::Config(format!(
                            "dose {idx} conversion trigger must lie in [0, 1), got {c}"
                        )));
                    }
                    if c < last_conversion {
                        return Err(SimError::Config(format!(
                            "dose {idx} at conversion {c} is scheduled before an earlier \
                             conversion dose"
                        )));
                    }
                    last_conversion = c;
                }
            }
        }
        Ok(())
    }
}
