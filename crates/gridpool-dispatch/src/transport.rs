//! Per-request HTTP/1 JSON transport to a worker endpoint.
//!
//! Workers expose `POST /rpc` at their assigned port. Each dispatch opens a
//! fresh connection; worker processes are short-lived and unreliable, so
//! pooled connections would mostly hold dead sockets.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use gridpool_wire::{RpcRequest, RpcResponse};

use crate::error::DispatchError;
use crate::pipeline::Endpoint;

/// The RPC path workers answer on.
const RPC_PATH: &str = "/rpc";

/// Stateless HTTP transport with a per-request time budget.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Post one RPC request and decode the response envelope.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        request: &RpcRequest,
    ) -> Result<RpcResponse, DispatchError> {
        let address = endpoint.address();
        let body = serde_json::to_vec(request).map_err(gridpool_wire::ProtocolError::from)?;

        tokio::time::timeout(self.request_timeout, self.send_inner(&address, body))
            .await
            .map_err(|_| DispatchError::Timeout)?
    }

    async fn send_inner(
        &self,
        address: &str,
        body: Vec<u8>,
    ) -> Result<RpcResponse, DispatchError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| {
                debug!(%address, error = %e, "worker connection failed");
                DispatchError::Connect(address.to_string())
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| {
                debug!(%address, error = %e, "worker handshake failed");
                DispatchError::Connect(address.to_string())
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(format!("http://{address}{RPC_PATH}"))
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "gridpool-dispatch/0.1")
            .body(Full::new(bytes::Bytes::from(body)))
            .map_err(|_| DispatchError::Connect(address.to_string()))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| {
                debug!(%address, error = %e, "worker rpc request failed");
                DispatchError::Connect(address.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            debug!(%address, %status, "worker rpc non-2xx");
            return Err(DispatchError::HttpStatus(status.as_u16()));
        }

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|_| DispatchError::Connect(address.to_string()))?;

        Ok(RpcResponse::decode(&collected.to_bytes())?)
    }
}
