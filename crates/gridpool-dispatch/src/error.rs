//! Dispatch error types and the default trip classification.

use thiserror::Error;

use gridpool_sentinel::SentinelError;
use gridpool_wire::ProtocolError;

/// Errors raised while dispatching an RPC to a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Tripped(#[from] SentinelError),

    #[error("could not connect to worker at {0}")]
    Connect(String),

    #[error("rpc to worker timed out")]
    Timeout,

    #[error("worker answered with http status {0}")]
    HttpStatus(u16),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("worker reported an error: {0}")]
    Rpc(String),

    #[error("pipeline completed without producing a response")]
    NoResponse,
}

impl DispatchError {
    /// The default trip-reason classification: transport-level failures
    /// count toward tripping a breaker, application and protocol errors do
    /// not. Gateway-class statuses indicate the worker itself is unwell.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            DispatchError::Connect(_) | DispatchError::Timeout => true,
            DispatchError::HttpStatus(status) => *status >= 500,
            DispatchError::Tripped(_)
            | DispatchError::Protocol(_)
            | DispatchError::Rpc(_)
            | DispatchError::NoResponse => false,
        }
    }
}
