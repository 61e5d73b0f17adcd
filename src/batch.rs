use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::config::SimulationConfig;
use crate::engine::{Engine, RunFailure, RunReport};
use crate::error::SimError;
use crate::rng::derive_seed;

/// Outcome of one run in a batch; a failing run does not stop the others.
pub type BatchResult = Result<RunReport, BatchFailure>;

#[derive(Debug, thiserror::Error)]
pub enum BatchFailure {
    #[error(transparent)]
    Config(#[from] SimError),
    #[error(transparent)]
    Run(#[from] RunFailure),
}

/// Runs every configuration on its own engine in parallel. Results come back
/// in input order. With `n_threads` set, a dedicated pool of that size is used
/// instead of the global one.
pub fn run_batch(
    configs: &[SimulationConfig],
    n_threads: Option<usize>,
) -> Result<Vec<BatchResult>, SimError> {
    let simulate = || -> Vec<BatchResult> {
        configs
            .par_iter()
            .map(|config| -> BatchResult {
                let engine = Engine::new(config.clone())?;
                Ok(engine.run()?)
            })
            .collect()
    };

    match n_threads {
        Some(n) => Ok(ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(simulate)),
        None => Ok(simulate()),
    }
}

/// `runs` copies of `config`, each with an independent seed derived from the
/// configured one.
pub fn replicate(config: &SimulationConfig, runs: usize) -> Vec<SimulationConfig> {
    (0..runs as u64)
        .map(|run| config.clone().with_seed(derive_seed(config.seed, run)))
        .collect()
}
