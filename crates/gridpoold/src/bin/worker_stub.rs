//! Stand-in for the real grid server binary, used by the end-to-end tests.
//!
//! Speaks just enough of the worker contract: listens on the port it is
//! handed, answers the TCP readiness probe by accepting, and serves the RPC
//! endpoint with canned echoes. A script body of `error()` produces an
//! error envelope; `--delay-ms` holds every RPC reply to keep an instance
//! visibly busy.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use clap::Parser;
use tracing::info;

use gridpool_wire::{LuaValue, RpcRequest, RpcResponse};

#[derive(Parser)]
#[command(name = "gridpool-worker-stub")]
struct Cli {
    /// Milliseconds to hold each RPC reply.
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Port to listen on; passed by the lifecycle manager.
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let router = Router::new()
        .route("/rpc", post(rpc))
        .with_state(cli.delay_ms);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "worker stub listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn rpc(State(delay_ms): State<u64>, Json(request): Json<RpcRequest>) -> Json<RpcResponse> {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    let response = match request {
        RpcRequest::Execute(req) if req.script.script == "error()" => {
            RpcResponse::err("script failure")
        }
        RpcRequest::Execute(req) => RpcResponse::ok(vec![LuaValue::string(req.script.script)]),
        RpcRequest::OpenJob(req) => RpcResponse::ok(vec![LuaValue::string(req.job.id)]),
        RpcRequest::Diag(req) => RpcResponse::ok(vec![LuaValue::number(req.diag_type as f64)]),
    };
    Json(response)
}
