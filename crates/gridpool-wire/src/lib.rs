//! gridpool-wire — the typed value tree passed across the worker boundary.
//!
//! Script arguments and results cross the process boundary as `LuaValue`
//! trees: tagged, recursive values that are either a scalar or a table,
//! never both. This crate owns those definitions plus the job/script
//! descriptors and the RPC request shapes built from them.

pub mod error;
pub mod job;
pub mod rpc;
pub mod value;

pub use error::ProtocolError;
pub use job::{Job, ScriptExecution};
pub use rpc::{DiagRequest, ExecuteRequest, OpenJobRequest, RpcRequest, RpcResponse};
pub use value::{LuaArg, LuaType, LuaValue};
