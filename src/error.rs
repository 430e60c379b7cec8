//! Crate error types.

use thiserror::Error;

/// Errors surfaced by agent processors and the coordinator.
///
/// Nothing here is fatal to the process: a failing processor costs that
/// agent its turn and the round moves on.
#[derive(Debug, Error)]
pub enum FanOutError {
    /// An agent processor refused the turn before accepting the work.
    #[error("agent processor rejected turn for {account_id}: {reason}")]
    ProcessorRejected { account_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FanOutError>;
