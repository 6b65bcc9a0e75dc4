//! A single pooled worker instance and its dispatch path.

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;

use gridpool_dispatch::{
    CircuitBreakerHandler, DispatchMetrics, Endpoint, HttpTransport, MetricsHandler, Pipeline,
    SendHandler,
};
use gridpool_process::WorkerProcess;
use gridpool_sentinel::CircuitBreaker;
use gridpool_wire::{RpcRequest, RpcResponse};

use crate::config::ArbiterConfig;
use crate::error::ArbiterResult;
use crate::lease::SubscriptionId;
use crate::resources::GridServerResource;

/// Where a slot sits in the lease cycle.
///
/// Only states a tracked slot can occupy appear here: starting instances
/// live in the pool's pending-start count and killed instances leave the
/// slot map entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Healthy, idle, available for the next lease.
    Ready,
    /// Claimed by a caller under an active lease.
    Leased,
    /// Worker process died out from under a ready slot; unclaimable,
    /// awaiting removal.
    Faulted,
}

pub(crate) struct InstanceInner {
    pub state: InstanceState,
    /// Epoch of the lease currently holding the slot; stale lease-end
    /// settles compare against it and back off.
    pub lease_epoch: u64,
    /// Leases served so far. Compared against `max_instance_reuses` when a
    /// lease ends to decide between returning to Ready and retiring.
    pub reuse_count: u32,
    /// Resource declaration of the current lease, returned to the tracker
    /// when the lease ends.
    pub declared: GridServerResource,
    /// Taken by the pool when the instance is killed.
    pub worker: Option<WorkerProcess>,
}

/// One pooled instance: the worker process plus the handler chain that
/// requests to it travel through. The chain is fixed at construction:
/// metrics first, then the per-instance circuit breaker, then the sender.
pub struct InstanceSlot {
    id: String,
    port: u16,
    breaker: Arc<CircuitBreaker>,
    pipeline: Pipeline,
    /// Lease-end subscription, set once when the pool installs the slot and
    /// cancelled when the slot is removed.
    pub(crate) subscription: OnceLock<SubscriptionId>,
    pub(crate) inner: Mutex<InstanceInner>,
}

impl InstanceSlot {
    pub(crate) fn new(
        worker: WorkerProcess,
        config: &ArbiterConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let id = worker.id.clone();
        let port = worker.port;
        let breaker = Arc::new(CircuitBreaker::new(id.clone(), config.breaker.clone()));

        let mut pipeline = Pipeline::new();
        pipeline
            .append_handler(Arc::new(MetricsHandler::new(metrics)))
            .append_handler(Arc::new(CircuitBreakerHandler::with_default_authority(
                Arc::clone(&breaker),
            )))
            .append_handler(Arc::new(SendHandler::new(
                HttpTransport::new(config.rpc_timeout),
                config.backoff.clone(),
            )));

        Self {
            id,
            port,
            breaker,
            pipeline,
            subscription: OnceLock::new(),
            inner: Mutex::new(InstanceInner {
                state: InstanceState::Ready,
                lease_epoch: 0,
                reuse_count: 0,
                declared: GridServerResource::none(),
                worker: Some(worker),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::localhost(self.port)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Sends a request through this instance's handler chain.
    pub async fn dispatch(&self, request: RpcRequest) -> ArbiterResult<RpcResponse> {
        Ok(self.pipeline.dispatch(self.endpoint(), request).await?)
    }

    pub async fn state(&self) -> InstanceState {
        self.inner.lock().await.state
    }

    pub async fn reuse_count(&self) -> u32 {
        self.inner.lock().await.reuse_count
    }

    /// OS pid of the backing worker, while one is attached.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.inner.lock().await.worker.as_ref().and_then(|w| w.pid())
    }
}
