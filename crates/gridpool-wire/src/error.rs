//! Wire model error types.

use thiserror::Error;

use crate::value::LuaType;

/// Errors raised while encoding or decoding wire payloads.
///
/// A protocol error is fatal to the single RPC that produced it and has no
/// effect on the health of the instance that answered.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("lua value has both scalar and table fields populated")]
    ScalarAndTable,

    #[error("lua value of type {0:?} is missing its payload")]
    MissingPayload(LuaType),

    #[error("lua value of type {0:?} carries an unexpected payload")]
    UnexpectedPayload(LuaType),

    #[error("malformed number literal: {0:?}")]
    BadNumber(String),

    #[error("malformed boolean literal: {0:?}")]
    BadBoolean(String),

    #[error("rpc response has neither a result nor an error")]
    EmptyEnvelope,

    #[error("malformed rpc payload: {0}")]
    Json(#[from] serde_json::Error),
}
