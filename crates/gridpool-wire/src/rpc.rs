//! RPC request and response shapes for the worker endpoint.
//!
//! Each shape maps 1:1 to an operation against a specific instance:
//! `OpenJob`, `Execute`, and `Diag`, keyed by job id. The response envelope
//! carries either a `LuaValue` result array or a worker-side error string.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::job::{Job, ScriptExecution};
use crate::value::LuaValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenJobRequest {
    pub job: Job,
    pub script: ScriptExecution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_id: String,
    pub script: ScriptExecution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagRequest {
    pub diag_type: i32,
    pub job_id: String,
}

/// The tagged union posted to a worker's RPC endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    OpenJob(OpenJobRequest),
    Execute(ExecuteRequest),
    Diag(DiagRequest),
}

impl RpcRequest {
    /// The job id this request targets.
    pub fn job_id(&self) -> &str {
        match self {
            RpcRequest::OpenJob(r) => &r.job.id,
            RpcRequest::Execute(r) => &r.job_id,
            RpcRequest::Diag(r) => &r.job_id,
        }
    }

    /// Short operation name for logs and metrics.
    pub fn op_name(&self) -> &'static str {
        match self {
            RpcRequest::OpenJob(_) => "open_job",
            RpcRequest::Execute(_) => "execute",
            RpcRequest::Diag(_) => "diag",
        }
    }
}

/// Response envelope returned by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<LuaValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(result: Vec<LuaValue>) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// Decode an envelope from a raw body and validate its value tree.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: RpcResponse = serde_json::from_slice(body)?;
        if envelope.result.is_none() && envelope.error.is_none() {
            return Err(ProtocolError::EmptyEnvelope);
        }
        if let Some(values) = &envelope.result {
            for value in values {
                value.validate()?;
            }
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_tags_the_operation() {
        let req = RpcRequest::Execute(ExecuteRequest {
            job_id: "job-1".to_string(),
            script: ScriptExecution::new("s", "return 1"),
        });
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""op":"execute""#));
        assert_eq!(req.job_id(), "job-1");
        assert_eq!(req.op_name(), "execute");
    }

    #[test]
    fn envelope_with_result_decodes() {
        let body = serde_json::to_vec(&RpcResponse::ok(vec![LuaValue::number(2.0)])).unwrap();
        let envelope = RpcResponse::decode(&body).unwrap();
        assert_eq!(envelope.result.unwrap()[0], LuaValue::number(2.0));
    }

    #[test]
    fn empty_envelope_is_a_protocol_error() {
        assert!(matches!(
            RpcResponse::decode(b"{}"),
            Err(ProtocolError::EmptyEnvelope)
        ));
    }

    #[test]
    fn malformed_result_tree_is_rejected() {
        let body = br#"{"result":[{"type":"LUA_TSTRING","value":"x","table":[]}]}"#;
        assert!(matches!(
            RpcResponse::decode(body),
            Err(ProtocolError::ScalarAndTable)
        ));
    }
}
