//! gridpoold — the gridpool daemon.
//!
//! Single binary that assembles the pool subsystems:
//! - Port allocator
//! - Process lifecycle manager
//! - Leased instance pool + background populator
//! - Status endpoint
//!
//! # Usage
//!
//! ```text
//! gridpoold run --worker-exe /usr/bin/grid-server --max-instances 10
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use tracing::info;

use gridpool_arbiter::{ArbiterConfig, InstancePool, ResourceSettings};
use gridpool_ports::{PortAllocator, PortAllocatorConfig};
use gridpool_process::{ProcessLifecycleManager, ProcessSettings};
use gridpool_sentinel::{Backoff, CircuitBreakerConfig};

#[derive(Parser)]
#[command(name = "gridpoold", about = "gridpool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pool in the foreground until interrupted.
    Run {
        /// Worker executable; launched with the assigned port appended.
        #[arg(long)]
        worker_exe: PathBuf,

        /// Extra arguments passed to the worker before the port.
        #[arg(long = "worker-arg")]
        worker_args: Vec<String>,

        /// Hard cap on concurrently running instances.
        #[arg(long, default_value = "10")]
        max_instances: usize,

        /// Leases an instance may serve before retirement.
        #[arg(long, default_value = "10")]
        max_instance_reuses: u32,

        /// Warm reserve kept ready by the populator.
        #[arg(long, default_value = "5")]
        reserve: usize,

        /// Concurrent populator tasks.
        #[arg(long, default_value = "2")]
        populate_threads: usize,

        /// Health probe attempts before a start is declared failed.
        #[arg(long, default_value = "10")]
        start_attempts: u32,

        /// Inclusive lower bound of the worker port range.
        #[arg(long, default_value = "45000")]
        port_min: u16,

        /// Exclusive upper bound of the worker port range.
        #[arg(long, default_value = "47000")]
        port_max: u16,

        /// Default lease duration in seconds.
        #[arg(long, default_value = "60")]
        lease_secs: u64,

        /// Consecutive trip-worthy failures before an instance's breaker opens.
        #[arg(long, default_value = "3")]
        breaker_failures: u32,

        /// Seconds a tripped breaker waits before admitting a trial call.
        #[arg(long, default_value = "5")]
        breaker_retry_secs: u64,

        /// Base send-retry backoff in milliseconds.
        #[arg(long, default_value = "100")]
        backoff_base_ms: u64,

        /// Send attempts per dispatch before the failure is surfaced.
        #[arg(long, default_value = "5")]
        max_send_attempts: u32,

        /// Port for the status endpoint.
        #[arg(long, default_value = "8443")]
        status_port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridpoold=debug,gridpool=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            worker_exe,
            worker_args,
            max_instances,
            max_instance_reuses,
            reserve,
            populate_threads,
            start_attempts,
            port_min,
            port_max,
            lease_secs,
            breaker_failures,
            breaker_retry_secs,
            backoff_base_ms,
            max_send_attempts,
            status_port,
        } => {
            run(RunOptions {
                worker_exe,
                worker_args,
                max_instances,
                max_instance_reuses,
                reserve,
                populate_threads,
                start_attempts,
                port_min,
                port_max,
                lease_secs,
                breaker_failures,
                breaker_retry_secs,
                backoff_base_ms,
                max_send_attempts,
                status_port,
            })
            .await
        }
    }
}

struct RunOptions {
    worker_exe: PathBuf,
    worker_args: Vec<String>,
    max_instances: usize,
    max_instance_reuses: u32,
    reserve: usize,
    populate_threads: usize,
    start_attempts: u32,
    port_min: u16,
    port_max: u16,
    lease_secs: u64,
    breaker_failures: u32,
    breaker_retry_secs: u64,
    backoff_base_ms: u64,
    max_send_attempts: u32,
    status_port: u16,
}

async fn run(opts: RunOptions) -> anyhow::Result<()> {
    info!("gridpool daemon starting");

    let ports = Arc::new(PortAllocator::new(PortAllocatorConfig {
        range: opts.port_min..opts.port_max,
        ..PortAllocatorConfig::default()
    }));

    let lifecycle = Arc::new(ProcessLifecycleManager::new(
        ProcessSettings {
            executable: opts.worker_exe,
            extra_args: opts.worker_args,
            start_attempts: opts.start_attempts,
            ..ProcessSettings::default()
        },
        ports,
    ));
    info!("process lifecycle manager initialized");

    let config = ArbiterConfig {
        max_instances: opts.max_instances,
        max_instance_reuses: opts.max_instance_reuses,
        ready_instances_to_keep_in_reserve: opts.reserve,
        populate_ready_instance_threads: opts.populate_threads,
        default_lease: Duration::from_secs(opts.lease_secs),
        breaker: CircuitBreakerConfig {
            failures_allowed_before_trip: opts.breaker_failures,
            retry_interval: Duration::from_secs(opts.breaker_retry_secs),
        },
        backoff: Backoff {
            base_delay: Duration::from_millis(opts.backoff_base_ms),
            max_attempts: opts.max_send_attempts,
            ..Backoff::default()
        },
        ..ArbiterConfig::default()
    };

    let pool = InstancePool::new(config, lifecycle, ResourceSettings::default());
    pool.start_populator();
    info!(
        max_instances = opts.max_instances,
        reserve = opts.reserve,
        "instance pool running"
    );

    // ── Status endpoint ───────────────────────────────────────

    let router = Router::new()
        .route("/status", get(status))
        .with_state(pool.clone());
    let addr = SocketAddr::from(([127, 0, 0, 1], opts.status_port));
    info!(%addr, "status endpoint starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
    });

    server.await?;

    pool.shutdown().await;
    info!("gridpool daemon stopped");
    Ok(())
}

async fn status(State(pool): State<InstancePool>) -> Json<serde_json::Value> {
    let (requests, failures, latency_us) = pool.metrics().snapshot();
    let in_use = pool.resources_in_use();
    Json(serde_json::json!({
        "instances": pool.instance_count(),
        "requests": requests,
        "failures": failures,
        "total_latency_us": latency_us,
        "resources_in_use": {
            "cores": in_use.cores,
            "threads": in_use.threads,
            "memory_bytes": in_use.memory_bytes,
        },
    }))
}
