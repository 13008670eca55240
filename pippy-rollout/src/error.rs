//! Rollout engine error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("store failed: {0}")]
    Store(#[from] pippy_store::StoreError),

    #[error("invalid target version")]
    InvalidTargetVersion,

    #[error("empty target version, please set target version before calling orchestrate")]
    EmptyTargetVersion,

    #[error("monitoring failed: {0}")]
    Monitoring(String),

    #[error("external controller failed: {0}")]
    Controller(String),
}
