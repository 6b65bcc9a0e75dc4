//! Worker spawn, readiness gating, and termination.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use gridpool_ports::{PortAllocator, PortError};

/// Errors raised by the lifecycle manager.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("worker failed to reach healthy state on port {port} after {attempts} attempts")]
    StartFailure { port: u16, attempts: u32 },

    #[error("worker executable could not be spawned: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("no port available for a new worker: {0}")]
    PortAllocation(#[from] PortError),
}

/// Outcome of a terminate-and-confirm operation.
///
/// All three outcomes are non-fatal to the pool; a stuck kill must never
/// block it from serving other instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    AlreadyExited,
    PermissionDenied,
}

/// Cheap liveness probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited,
    /// Inspection failed; assume running to avoid false-positive reaping.
    Inaccessible,
}

/// Settings for spawning and health-gating workers.
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Path to the worker executable.
    pub executable: PathBuf,
    /// Arguments placed before the port argument.
    pub extra_args: Vec<String>,
    /// Health probe attempts before a start is declared failed.
    pub start_attempts: u32,
    /// Sleep between health probe attempts.
    pub wait_for_tcp_sleep_interval: Duration,
    /// Per-probe connect timeout.
    pub probe_timeout: Duration,
    /// How long to wait for exit confirmation after a terminate.
    pub kill_confirm_timeout: Duration,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("grid-server"),
            extra_args: Vec::new(),
            start_attempts: 10,
            wait_for_tcp_sleep_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
            kill_confirm_timeout: Duration::from_secs(5),
        }
    }
}

/// One spawned worker process and its assigned port.
#[derive(Debug)]
pub struct WorkerProcess {
    pub id: String,
    pub port: u16,
    /// Health probe attempts it took to reach readiness.
    pub start_attempts_used: u32,
    child: Child,
}

impl WorkerProcess {
    /// OS process id, if the process is still attached.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawns and reaps worker processes; owns the port allocator handle.
pub struct ProcessLifecycleManager {
    settings: ProcessSettings,
    ports: Arc<PortAllocator>,
    next_instance: AtomicU64,
}

impl ProcessLifecycleManager {
    pub fn new(settings: ProcessSettings, ports: Arc<PortAllocator>) -> Self {
        Self {
            settings,
            ports,
            next_instance: AtomicU64::new(0),
        }
    }

    /// The port allocator shared with this manager.
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Spawn a worker and wait for it to become healthy.
    ///
    /// Allocates a port, launches the executable with the port appended to
    /// its arguments, then polls a TCP connect probe until the worker
    /// answers or the attempt ceiling is exhausted. On failure the
    /// half-started process is killed and the port released before the
    /// error is returned.
    pub async fn start_instance(&self) -> Result<WorkerProcess, ProcessError> {
        let port = self.ports.find_next_available_port()?;
        let id = format!(
            "grid-server-{}",
            self.next_instance.fetch_add(1, Ordering::Relaxed)
        );

        let started = Instant::now();
        debug!(%id, port, executable = %self.settings.executable.display(), "spawning worker");

        let child = Command::new(&self.settings.executable)
            .args(&self.settings.extra_args)
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut worker = match child {
            Ok(child) => WorkerProcess {
                id,
                port,
                start_attempts_used: 0,
                child,
            },
            Err(e) => {
                self.ports.remove_port_from_cache_if_exists(port);
                return Err(ProcessError::Spawn(e));
            }
        };

        match self.wait_for_healthy(&mut worker).await {
            Ok(attempts) => {
                worker.start_attempts_used = attempts;
                info!(
                    id = %worker.id,
                    port,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "worker reached healthy state"
                );
                Ok(worker)
            }
            Err(attempts) => {
                warn!(
                    id = %worker.id,
                    port,
                    attempts,
                    "worker never became healthy, discarding"
                );
                self.kill(&mut worker).await;
                Err(ProcessError::StartFailure { port, attempts })
            }
        }
    }

    /// Poll the worker's port until it accepts a connection.
    ///
    /// Aborts early if the child has already exited, since the probe can
    /// never succeed then. Returns the attempt count either way.
    async fn wait_for_healthy(&self, worker: &mut WorkerProcess) -> Result<u32, u32> {
        for attempt in 1..=self.settings.start_attempts {
            if let Ok(Some(status)) = worker.child.try_wait() {
                debug!(id = %worker.id, %status, "worker exited before becoming healthy");
                return Err(attempt);
            }

            let probe = tokio::time::timeout(
                self.settings.probe_timeout,
                TcpStream::connect(("127.0.0.1", worker.port)),
            )
            .await;

            match probe {
                Ok(Ok(_)) => return Ok(attempt),
                Ok(Err(e)) => {
                    debug!(id = %worker.id, port = worker.port, attempt, error = %e, "health probe refused")
                }
                Err(_) => {
                    debug!(id = %worker.id, port = worker.port, attempt, "health probe timed out")
                }
            }

            tokio::time::sleep(self.settings.wait_for_tcp_sleep_interval).await;
        }

        Err(self.settings.start_attempts)
    }

    /// Forcibly terminate a worker and confirm its exit.
    ///
    /// Best effort by contract: every failure mode maps to a non-fatal
    /// outcome, and the port reservation is released regardless.
    pub async fn kill(&self, worker: &mut WorkerProcess) -> TerminateOutcome {
        let outcome = match worker.child.try_wait() {
            Ok(Some(_)) => TerminateOutcome::AlreadyExited,
            _ => match worker.child.start_kill() {
                Ok(()) => {
                    let confirmed = tokio::time::timeout(
                        self.settings.kill_confirm_timeout,
                        worker.child.wait(),
                    )
                    .await;
                    match confirmed {
                        Ok(Ok(status)) => {
                            debug!(id = %worker.id, %status, "worker terminated");
                            TerminateOutcome::Terminated
                        }
                        Ok(Err(e)) => {
                            warn!(id = %worker.id, error = %e, "exit confirmation failed");
                            TerminateOutcome::Terminated
                        }
                        Err(_) => {
                            warn!(id = %worker.id, "worker did not confirm exit in time");
                            TerminateOutcome::Terminated
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    warn!(id = %worker.id, "no permission to terminate worker");
                    TerminateOutcome::PermissionDenied
                }
                Err(e) => {
                    // start_kill on an already-reaped child reports InvalidInput.
                    debug!(id = %worker.id, error = %e, "terminate found worker already gone");
                    TerminateOutcome::AlreadyExited
                }
            },
        };

        self.ports.remove_port_from_cache_if_exists(worker.port);
        outcome
    }

    /// Distinguish running, exited, and inaccessible without blocking.
    pub fn is_alive(&self, worker: &mut WorkerProcess) -> Liveness {
        match worker.child.try_wait() {
            Ok(None) => Liveness::Running,
            Ok(Some(_)) => Liveness::Exited,
            Err(_) => Liveness::Inaccessible,
        }
    }
}
