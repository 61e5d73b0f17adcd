use thiserror::Error;

use crate::population::ChainId;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("dosing entry {due} is due while earlier entry {pending} is still pending")]
    ScheduleOrder { pending: usize, due: usize },
    #[error("chain {id} cannot be used: {reason}")]
    InvalidChainState { id: ChainId, reason: &'static str },
    #[error("invalid kinetic state: {0}")]
    InvalidState(String),
    #[error("simulation invariant violated: {0}")]
    Invariant(String),
    #[error("failed to parse chain lengths: {0}")]
    Parse(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// True for errors that can only be produced by a desynchronised run.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::InvalidChainState { .. } | Self::InvalidState(_)
        )
    }
}
