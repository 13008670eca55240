//! Orchestrator error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store failed: {0}")]
    Store(#[from] pippy_store::StoreError),

    #[error("github failed: {0}")]
    Github(#[from] pippy_github::GithubError),

    #[error("rollout engine failed: {0}")]
    Rollout(#[from] pippy_rollout::RolloutError),

    #[error("{0}")]
    Locked(String),

    #[error("{stage} invalid stage, choose between 0 and {max}")]
    InvalidStage { stage: i64, max: usize },

    #[error("orchestrator engine is not set up")]
    EngineNotReady,

    #[error("{0}")]
    Invalid(String),
}

impl OrchestratorError {
    /// True when the underlying cause is a missing store key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::Store(err) if err.is_not_found())
    }
}
