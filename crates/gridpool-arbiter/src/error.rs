//! Arbiter error types.

use std::time::Duration;

use thiserror::Error;

use gridpool_dispatch::DispatchError;
use gridpool_process::ProcessError;

use crate::resources::RejectionReason;

/// Errors surfaced by the instance pool to its callers.
///
/// Kill and port-release failures never appear here: cleanup is best-effort
/// by contract and must not block the pool from serving other instances.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no ready instance became available within {0:?}")]
    NoReadyInstance(Duration),

    #[error("declared cpu need exceeds configured capacity")]
    CpuAllocationExceeded,

    #[error("declared thread need exceeds configured capacity")]
    ThreadsAllocationExceeded,

    #[error("declared memory need exceeds configured capacity")]
    MemoryAllocationExceeded,

    #[error("instance '{0}' is not currently leased")]
    NotLeased(String),

    #[error("failed to start a worker instance")]
    Start(#[from] ProcessError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("call was canceled by the caller")]
    Canceled,
}

pub type ArbiterResult<T> = Result<T, ArbiterError>;

impl From<RejectionReason> for ArbiterError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::CpuAllocationExceeded => ArbiterError::CpuAllocationExceeded,
            RejectionReason::ThreadsAllocationExceeded => ArbiterError::ThreadsAllocationExceeded,
            RejectionReason::MemoryAllocationExceeded => ArbiterError::MemoryAllocationExceeded,
        }
    }
}
