//! Event-driven kinetic engine.
//!
//! One [`Engine`] owns the species counts, chain population, dosing position
//! and random stream of a single run. Events are drawn with the Gillespie
//! direct method; scheduled doses pre-empt the drawn reaction whenever they
//! fall due first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{DoseTrigger, SimulationConfig};
use crate::dosing::DosingController;
use crate::error::SimError;
use crate::population::ChainPopulation;
use crate::propensity::{CHANNEL_COUNT, Channel, PropensityModel, SpeciesCounts};
use crate::report::{Observation, Reporter, Snapshot, SnapshotTrigger, TimeSeries};
use crate::rng::VariateSource;

// Borrows only the population field, so the reporter stays writable while
// the observation is alive.
macro_rules! observation {
    ($engine:expr) => {
        Observation {
            time: $engine.clock,
            events: $engine.events,
            conversion: $engine.conversion(),
            monomer: $engine.counts.monomer,
            introduced_monomer: $engine.introduced_monomer,
            population: &$engine.population,
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    TargetsReached,
    ConversionReached,
    EventLimit,
    TimeLimit,
    Stalled,
    Cancelled,
}

impl TerminationReason {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            TerminationReason::TargetsReached | TerminationReason::ConversionReached
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EngineState {
    Running,
    /// Clock sits at the trigger of dose `entry`, which fires on the next step.
    DoseInterrupt { entry: usize },
    Terminated(TerminationReason),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    Reacted(Channel),
    DoseDue { entry: usize, time: f64 },
    Dosed { entry: usize },
    Finished(TerminationReason),
}

/// Cooperative stop request shared with the caller. The engine checks it
/// between events.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub reason: TerminationReason,
    pub converged: bool,
    pub events: u64,
    pub time: f64,
    pub final_snapshot: Snapshot,
    /// Target, checkpoint and final snapshots in emission order.
    pub snapshots: Vec<Snapshot>,
    pub series: TimeSeries,
    pub channel_counts: [u64; CHANNEL_COUNT],
    pub doses_fired: usize,
    pub introduced_monomer: u64,
    pub unreacted_monomer: u64,
}

impl RunReport {
    pub fn channel_count(&self, channel: Channel) -> u64 {
        self.channel_counts[channel.index()]
    }

    pub fn snapshot_for_target(&self, target: f64) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .find(|s| s.trigger == SnapshotTrigger::Target(target))
    }
}

/// A run aborted by an error, with the last consistent state it reached.
#[derive(Debug, thiserror::Error)]
#[error("run aborted at t = {time} after {events} events: {error}")]
pub struct RunFailure {
    #[source]
    pub error: SimError,
    pub last_snapshot: Box<Snapshot>,
    pub time: f64,
    pub events: u64,
}

pub struct Engine {
    config: SimulationConfig,
    rng: VariateSource,
    model: PropensityModel,
    population: ChainPopulation,
    counts: SpeciesCounts,
    dosing: DosingController,
    reporter: Reporter,
    state: EngineState,
    clock: f64,
    events: u64,
    introduced_monomer: u64,
    // Cleared by every dose; set again once Mn is seen below the highest
    // target. The targets stop only applies while set.
    target_stop_armed: bool,
    channel_counts: [u64; CHANNEL_COUNT],
    cancel: Option<CancelToken>,
}

impl Engine {
    pub fn new(config: SimulationConfig) -> Result<Self, SimError> {
        config.validate()?;
        let counts = SpeciesCounts {
            monomer: config.initial_monomer,
            initiator: config.initial_initiator,
            radicals: 0,
        };
        let mut model = PropensityModel::new(&config.rates);
        model.rebuild(&counts);
        let planned_monomer = config.planned_monomer()?;
        info!(
            monomer = planned_monomer,
            initiator = config.initial_initiator,
            doses = config.dosing.len(),
            targets = ?config.target_dp,
            seed = config.seed,
            "Starting polymerization run"
        );
        Ok(Self {
            rng: VariateSource::seeded(config.seed),
            model,
            population: ChainPopulation::new(),
            counts,
            dosing: DosingController::new(config.dosing.clone()),
            reporter: Reporter::new(&config),
            state: EngineState::Running,
            clock: 0.0,
            events: 0,
            introduced_monomer: config.initial_monomer,
            target_stop_armed: true,
            channel_counts: [0; CHANNEL_COUNT],
            cancel: None,
            config,
        })
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn time(&self) -> f64 {
        self.clock
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn counts(&self) -> &SpeciesCounts {
        &self.counts
    }

    pub fn population(&self) -> &ChainPopulation {
        &self.population
    }

    pub fn introduced_monomer(&self) -> u64 {
        self.introduced_monomer
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Monomer held in chains over the monomer introduced so far. A dose
    /// lowers it; without dosing it is `(M0 - M) / M0`.
    pub fn conversion(&self) -> f64 {
        if self.introduced_monomer == 0 {
            0.0
        } else {
            self.population.dp_sum() as f64 / self.introduced_monomer as f64
        }
    }

    /// Snapshot of the current state; does not touch the run's records.
    pub fn snapshot(&self) -> Snapshot {
        self.observation().snapshot(SnapshotTrigger::Requested)
    }

    /// Runs to termination.
    pub fn run(mut self) -> Result<RunReport, RunFailure> {
        while !matches!(self.state, EngineState::Terminated(_)) {
            if let Err(err) = self.step() {
                return Err(self.fail(err));
            }
        }
        Ok(self.into_report())
    }

    /// Performs one transition of the state machine.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        match self.state {
            EngineState::Terminated(reason) => Ok(StepOutcome::Finished(reason)),
            EngineState::DoseInterrupt { entry } => self.fire_dose(entry),
            EngineState::Running => self.advance(),
        }
    }

    fn advance(&mut self) -> Result<StepOutcome, SimError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Ok(self.terminate(TerminationReason::Cancelled));
        }
        let conversion = self.conversion();
        if let Some(entry) = self.dosing.next_due(self.clock, conversion)? {
            return Ok(self.interrupt(entry, self.clock));
        }
        self.model.check_not_underflowed(&self.counts)?;

        let total = self.model.total();
        let candidate = self.clock + self.rng.exponential(total);
        let max_time = self.config.max_time.unwrap_or(f64::INFINITY);
        if let Some(entry) = self.dosing.next_due(candidate.min(max_time), conversion)? {
            let time = match self.dosing.entry(entry).map(|d| d.trigger) {
                Some(DoseTrigger::Time(t)) => t.max(self.clock),
                _ => self.clock,
            };
            return Ok(self.interrupt(entry, time));
        }

        if total <= 0.0 {
            let awaiting_time_dose = self
                .dosing
                .pending()
                .iter()
                .any(|d| matches!(d.trigger, DoseTrigger::Time(_)));
            if awaiting_time_dose && max_time.is_finite() {
                self.advance_clock(max_time);
                return Ok(self.terminate(TerminationReason::TimeLimit));
            }
            return Ok(self.terminate(TerminationReason::Stalled));
        }
        if candidate > max_time {
            self.advance_clock(max_time);
            return Ok(self.terminate(TerminationReason::TimeLimit));
        }

        self.advance_clock(candidate);
        let channel = self.model.select(self.rng.uniform());
        self.fire_channel(channel)?;
        self.events += 1;
        self.channel_counts[channel.index()] += 1;
        self.after_mutation()?;
        Ok(StepOutcome::Reacted(channel))
    }

    /// Applies one reaction event to the population and species counts.
    pub(crate) fn fire_channel(&mut self, channel: Channel) -> Result<(), SimError> {
        let next = self.counts.after(channel)?;
        match channel {
            Channel::Initiation => {
                self.population.create_chain();
            }
            Channel::Propagation => {
                let id = self.population.select_random_growing_chain(&mut self.rng)?;
                self.population.grow(id)?;
            }
            Channel::Combination => {
                let (a, b) = self.population.select_growing_pair(&mut self.rng)?;
                self.population.terminate_combination(a, b)?;
            }
            Channel::Disproportionation => {
                let (a, b) = self.population.select_growing_pair(&mut self.rng)?;
                self.population.terminate_disproportionation(a, Some(b))?;
            }
            Channel::Transfer => {
                let id = self.population.select_random_growing_chain(&mut self.rng)?;
                self.population.terminate_disproportionation(id, None)?;
                self.population.create_chain();
            }
        }
        self.counts = next;
        self.model.after_event(channel, &self.counts);
        Ok(())
    }

    fn interrupt(&mut self, entry: usize, time: f64) -> StepOutcome {
        self.advance_clock(time);
        self.state = EngineState::DoseInterrupt { entry };
        StepOutcome::DoseDue { entry, time }
    }

    fn fire_dose(&mut self, entry: usize) -> Result<StepOutcome, SimError> {
        let (dose, changed) = self.dosing.fire(entry, &mut self.counts)?;
        self.introduced_monomer += dose.monomer;
        self.model.after_species_change(&changed, &self.counts);
        self.state = EngineState::Running;
        self.target_stop_armed = false;
        debug!(
            entry,
            time = self.clock,
            monomer = dose.monomer,
            initiator = dose.initiator,
            conversion = self.conversion(),
            "Dose fired"
        );
        self.after_mutation()?;
        Ok(StepOutcome::Dosed { entry })
    }

    fn advance_clock(&mut self, time: f64) {
        if time > self.clock {
            let obs = observation!(self);
            self.reporter.record_samples_before(time, &obs);
            self.clock = time;
        }
    }

    fn after_mutation(&mut self) -> Result<(), SimError> {
        self.check_consistency()?;
        let obs = observation!(self);
        self.reporter.observe(&obs);
        let mn = self.population.number_average();
        if self.reporter.highest_target().is_some_and(|t| mn < t) {
            self.target_stop_armed = true;
        }
        if let Some(reason) = self.stop_reason() {
            self.terminate(reason);
        }
        Ok(())
    }

    fn stop_reason(&self) -> Option<TerminationReason> {
        if self.dosing.is_exhausted() {
            if self.conversion() >= self.config.conversion_limit {
                return Some(TerminationReason::ConversionReached);
            }
            let mn = self.population.number_average();
            if self.target_stop_armed
                && self.reporter.targets_reached()
                && self.reporter.highest_target().is_some_and(|t| mn >= t)
            {
                return Some(TerminationReason::TargetsReached);
            }
        }
        if self.config.max_events.is_some_and(|max| self.events >= max) {
            return Some(TerminationReason::EventLimit);
        }
        None
    }

    fn check_consistency(&self) -> Result<(), SimError> {
        if self.counts.radicals != self.population.growing_len() as u64 {
            return Err(SimError::Invariant(format!(
                "radical count {} disagrees with {} growing chains",
                self.counts.radicals,
                self.population.growing_len()
            )));
        }
        if self.population.dp_sum() + self.counts.monomer != self.introduced_monomer {
            return Err(SimError::Invariant(format!(
                "monomer balance broken: {} in chains + {} free != {} introduced",
                self.population.dp_sum(),
                self.counts.monomer,
                self.introduced_monomer
            )));
        }
        Ok(())
    }

    fn terminate(&mut self, reason: TerminationReason) -> StepOutcome {
        let obs = observation!(self);
        self.reporter.finish(&obs);
        self.state = EngineState::Terminated(reason);
        let stats = obs.statistics();
        match reason {
            TerminationReason::EventLimit
            | TerminationReason::TimeLimit
            | TerminationReason::Stalled => warn!(
                ?reason,
                events = self.events,
                time = self.clock,
                mn = stats.mn,
                dispersity = stats.dispersity,
                "Run ended before convergence"
            ),
            _ => info!(
                ?reason,
                events = self.events,
                time = self.clock,
                conversion = obs.conversion,
                mn = stats.mn,
                dispersity = stats.dispersity,
                "Run finished"
            ),
        }
        StepOutcome::Finished(reason)
    }

    fn observation(&self) -> Observation<'_> {
        observation!(self)
    }

    fn fail(self, error: SimError) -> RunFailure {
        error!(
            %error,
            events = self.events,
            time = self.clock,
            "Run aborted"
        );
        RunFailure {
            last_snapshot: Box::new(self.snapshot()),
            time: self.clock,
            events: self.events,
            error,
        }
    }

    fn into_report(self) -> RunReport {
        let reason = match self.state {
            EngineState::Terminated(reason) => reason,
            _ => TerminationReason::Cancelled,
        };
        let final_snapshot = self
            .reporter
            .last_snapshot()
            .cloned()
            .unwrap_or_else(|| self.snapshot());
        let doses_fired = self.dosing.fired_count();
        let (snapshots, series) = self.reporter.into_parts();
        RunReport {
            reason,
            converged: reason.is_converged(),
            events: self.events,
            time: self.clock,
            final_snapshot,
            snapshots,
            series,
            channel_counts: self.channel_counts,
            doses_fired,
            introduced_monomer: self.introduced_monomer,
            unreacted_monomer: self.counts.monomer,
        }
    }
}
