//! Accelerated stochastic simulation of free-radical polymerization.
//!
//! An [`Engine`] evolves the chain-length population of a batch or
//! semi-batch reactor with the Gillespie direct method: initiation,
//! propagation, termination by combination or disproportionation and chain
//! transfer, interleaved with scheduled monomer/initiator doses. Propensities
//! are maintained incrementally and growing chains live in a swap-remove set,
//! so the per-event cost does not grow with the population. Runs emit
//! snapshots of the full chain-length list whenever the number-average DP
//! crosses a target or conversion crosses a checkpoint.

pub mod batch;
pub mod config;
pub mod dosing;
pub mod engine;
pub mod error;
pub mod output;
pub mod population;
pub mod propensity;
pub mod report;
pub mod rng;

pub use batch::{BatchFailure, BatchResult, replicate, run_batch};
pub use config::{DoseEntry, DoseTrigger, RateConstants, SchedulePreset, SimulationConfig};
pub use dosing::DosingController;
pub use engine::{
    CancelToken, Engine, EngineState, RunFailure, RunReport, StepOutcome, TerminationReason,
};
pub use error::SimError;
pub use population::{ChainId, ChainPopulation, ChainStatus};
pub use propensity::{Channel, PropensityModel, Species, SpeciesCounts};
pub use report::{
    ChainLengthHistogram, ConversionPoint, MolecularWeightPoint, Snapshot, SnapshotTrigger,
    Statistics, TimeSeries,
};
pub use rng::{VariateSource, derive_seed};
