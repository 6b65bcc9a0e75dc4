//! The instance pool — leases workers, keeps a warm reserve, retires
//! instances past their reuse cap.
//!
//! Locking discipline: the pool-level std mutex guards only the slot map and
//! the pending-start counter and is never held across an await. Per-slot
//! state transitions go through each slot's async mutex. Process spawning
//! and health probing happen outside every lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gridpool_dispatch::DispatchMetrics;
use gridpool_process::{Liveness, ProcessLifecycleManager};
use gridpool_wire::{
    DiagRequest, ExecuteRequest, Job, LuaValue, OpenJobRequest, RpcRequest, ScriptExecution,
};

use crate::config::ArbiterConfig;
use crate::error::{ArbiterError, ArbiterResult};
use crate::instance::{InstanceSlot, InstanceState};
use crate::lease::{Lease, LeaseRegistry};
use crate::resources::{GridServerResource, ResourceAllocationTracker, ResourceSettings};

/// A claimed instance together with its active lease.
pub struct LeaseGrant {
    pub instance: Arc<InstanceSlot>,
    pub lease: Lease,
}

impl std::fmt::Debug for LeaseGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGrant")
            .field("instance", &self.instance.id())
            .field("lease", &self.lease)
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<String, Arc<InstanceSlot>>,
    /// Spawns in flight, counted against `max_instances` so concurrent
    /// callers cannot overshoot the cap.
    pending_starts: usize,
}

/// Pool of leased worker instances.
///
/// Cheap to clone; clones share all state. Constructed explicitly and
/// passed to whoever needs it.
#[derive(Clone)]
pub struct InstancePool {
    config: Arc<ArbiterConfig>,
    lifecycle: Arc<ProcessLifecycleManager>,
    leases: LeaseRegistry,
    resources: Arc<ResourceAllocationTracker>,
    metrics: Arc<DispatchMetrics>,
    state: Arc<StdMutex<PoolState>>,
    /// Pinged once per freed slot or freed capacity; waiters in
    /// `get_or_create_available_leased_instance` park on it.
    ready: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl InstancePool {
    pub fn new(
        config: ArbiterConfig,
        lifecycle: Arc<ProcessLifecycleManager>,
        resource_settings: ResourceSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            lifecycle,
            leases: LeaseRegistry::new(),
            resources: Arc::new(ResourceAllocationTracker::new(resource_settings)),
            metrics: Arc::new(DispatchMetrics::default()),
            state: Arc::new(StdMutex::new(PoolState::default())),
            ready: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    pub fn resources_in_use(&self) -> GridServerResource {
        self.resources.in_use()
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    /// Ids of the currently tracked instances.
    pub fn instance_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().slots.keys().cloned().collect()
    }

    /// Claims a leased instance for the caller.
    ///
    /// Admission runs first: a declaration that exceeds pool capacity is
    /// rejected before any instance work. Then, in order: claim a ready
    /// instance, start a fresh one if under `max_instances`, or wait up to
    /// `timeout` for a slot to free. A zero timeout fails immediately when
    /// nothing is ready and no capacity remains.
    pub async fn get_or_create_available_leased_instance(
        &self,
        timeout: Duration,
        resource: GridServerResource,
    ) -> ArbiterResult<LeaseGrant> {
        self.resources
            .try_allocate(&resource)
            .map_err(ArbiterError::from)?;

        match self.acquire_inner(timeout, &resource).await {
            Ok(grant) => Ok(grant),
            Err(err) => {
                self.resources.release(&resource);
                Err(err)
            }
        }
    }

    async fn acquire_inner(
        &self,
        timeout: Duration,
        resource: &GridServerResource,
    ) -> ArbiterResult<LeaseGrant> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before scanning so a release between the
            // scan and the park cannot be missed.
            let freed = self.ready.notified();

            if let Some(grant) = self.try_claim_ready(resource).await {
                return Ok(grant);
            }

            match self.try_start_instance().await {
                Ok(Some(slot)) => {
                    if let Some(lease) = self.claim_slot(&slot, resource).await {
                        return Ok(LeaseGrant {
                            instance: slot,
                            lease,
                        });
                    }
                    // The populator or another caller raced us to the
                    // fresh slot; fall through and wait.
                }
                Ok(None) => {}
                // A failed start discards that instance; keep trying fresh
                // starts until the deadline, then surface the last error.
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    warn!(%err, "instance start failed, retrying");
                    let pause = self.config.populate_interval.min(
                        deadline.saturating_duration_since(Instant::now()),
                    );
                    tokio::time::sleep(pause).await;
                    continue;
                }
            }

            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(ArbiterError::NoReadyInstance(timeout));
            }
        }
    }

    async fn try_claim_ready(&self, resource: &GridServerResource) -> Option<LeaseGrant> {
        let slots: Vec<Arc<InstanceSlot>> = {
            let state = self.state.lock().unwrap();
            state.slots.values().cloned().collect()
        };
        for slot in slots {
            if let Some(lease) = self.claim_slot(&slot, resource).await {
                return Some(LeaseGrant {
                    instance: slot,
                    lease,
                });
            }
        }
        None
    }

    /// Atomic Ready → Leased transition plus lease grant. The grant happens
    /// under the slot lock so the recorded epoch always matches the lease
    /// holding the slot.
    async fn claim_slot(
        &self,
        slot: &Arc<InstanceSlot>,
        resource: &GridServerResource,
    ) -> Option<Lease> {
        let mut inner = slot.inner.lock().await;
        if inner.state != InstanceState::Ready {
            return None;
        }
        let lease = self.leases.grant(slot.id(), self.config.default_lease);
        inner.state = InstanceState::Leased;
        inner.lease_epoch = lease.epoch;
        inner.declared = *resource;
        drop(inner);
        debug!(instance_id = slot.id(), "instance leased");
        Some(lease)
    }

    /// Starts a fresh instance if the pool is under `max_instances`.
    /// Returns `Ok(None)` when at capacity.
    async fn try_start_instance(&self) -> ArbiterResult<Option<Arc<InstanceSlot>>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.slots.len() + state.pending_starts >= self.config.max_instances {
                return Ok(None);
            }
            state.pending_starts += 1;
        }

        let worker = match self.lifecycle.start_instance().await {
            Ok(worker) => worker,
            Err(err) => {
                self.state.lock().unwrap().pending_starts -= 1;
                return Err(err.into());
            }
        };

        let slot = Arc::new(InstanceSlot::new(
            worker,
            &self.config,
            Arc::clone(&self.metrics),
        ));
        self.install_slot(Arc::clone(&slot));
        Ok(Some(slot))
    }

    fn install_slot(&self, slot: Arc<InstanceSlot>) {
        let id = slot.id().to_owned();
        {
            let mut state = self.state.lock().unwrap();
            state.pending_starts = state.pending_starts.saturating_sub(1);
            state.slots.insert(id.clone(), Arc::clone(&slot));
        }
        let pool = self.clone();
        let subscription = self.leases.subscribe(&id, move |instance_id, epoch| {
            let pool = pool.clone();
            let instance_id = instance_id.to_owned();
            tokio::spawn(async move {
                pool.handle_lease_end(&instance_id, epoch).await;
            });
        });
        let _ = slot.subscription.set(subscription);
    }

    /// Runs when a lease expires or is released: bumps the reuse count,
    /// returns the declared resources, then either retires the instance or
    /// hands it back to the ready set.
    ///
    /// `epoch` names the lease that ended. The settle runs both inline on
    /// the release path and from the listener task, so it must no-op for
    /// any lease but the one currently holding the slot — otherwise a
    /// stale settle would free a successor's live lease.
    async fn handle_lease_end(&self, instance_id: &str, epoch: u64) {
        let slot = {
            let state = self.state.lock().unwrap();
            state.slots.get(instance_id).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        let retire = {
            let mut inner = slot.inner.lock().await;
            if inner.state != InstanceState::Leased || inner.lease_epoch != epoch {
                return;
            }
            inner.reuse_count += 1;
            self.resources.release(&inner.declared);
            inner.declared = GridServerResource::none();
            if inner.reuse_count >= self.config.max_instance_reuses {
                true
            } else {
                inner.state = InstanceState::Ready;
                false
            }
        };

        if retire {
            info!(instance_id, "reuse cap reached, retiring instance");
            self.remove_and_kill(&slot).await;
        } else {
            debug!(instance_id, "instance returned to ready set");
        }
        // Either a ready slot or fresh start capacity became available.
        self.ready.notify_one();
    }

    async fn remove_and_kill(&self, slot: &Arc<InstanceSlot>) {
        {
            let mut state = self.state.lock().unwrap();
            state.slots.remove(slot.id());
        }
        if let Some(subscription) = slot.subscription.get() {
            self.leases.unsubscribe(slot.id(), *subscription);
        }
        let worker = slot.inner.lock().await.worker.take();
        if let Some(mut worker) = worker {
            let outcome = self.lifecycle.kill(&mut worker).await;
            debug!(instance_id = slot.id(), ?outcome, "instance killed");
        }
    }

    /// Ends a lease early, returning the instance to the pool. Returns
    /// `NotLeased` when the instance holds no active lease.
    pub async fn release(&self, instance_id: &str) -> ArbiterResult<()> {
        if let Some(epoch) = self.leases.release(instance_id) {
            // The release listener settles the slot on a spawned task;
            // settle inline too so the caller observes the final state.
            // The epoch guard makes the second settle a no-op.
            self.handle_lease_end(instance_id, epoch).await;
            Ok(())
        } else {
            Err(ArbiterError::NotLeased(instance_id.to_owned()))
        }
    }

    /// Extends an active lease by its original duration.
    pub fn renew(&self, instance_id: &str) -> ArbiterResult<Lease> {
        self.leases
            .renew(instance_id)
            .ok_or_else(|| ArbiterError::NotLeased(instance_id.to_owned()))
    }

    /// Runs a script on a leased instance and releases the lease afterwards,
    /// on every path including errors and cancellation.
    pub async fn execute_script(
        &self,
        script: ScriptExecution,
        resource: GridServerResource,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ArbiterResult<Vec<LuaValue>> {
        let grant = self
            .get_or_create_available_leased_instance(self.config.acquire_timeout, resource)
            .await?;
        let request = RpcRequest::Execute(ExecuteRequest {
            job_id: grant.instance.id().to_owned(),
            script,
        });
        self.dispatch_leased(grant, request, cancel).await
    }

    /// Opens a job on a leased instance, running its startup script.
    pub async fn open_job(
        &self,
        job: Job,
        script: ScriptExecution,
        resource: GridServerResource,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ArbiterResult<Vec<LuaValue>> {
        let grant = self
            .get_or_create_available_leased_instance(self.config.acquire_timeout, resource)
            .await?;
        let request = RpcRequest::OpenJob(OpenJobRequest { job, script });
        self.dispatch_leased(grant, request, cancel).await
    }

    /// Fetches diagnostics from a leased instance.
    pub async fn diag_ex(
        &self,
        diag_type: i32,
        job_id: impl Into<String>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ArbiterResult<Vec<LuaValue>> {
        let grant = self
            .get_or_create_available_leased_instance(
                self.config.acquire_timeout,
                GridServerResource::none(),
            )
            .await?;
        let request = RpcRequest::Diag(DiagRequest {
            diag_type,
            job_id: job_id.into(),
        });
        self.dispatch_leased(grant, request, cancel).await
    }

    async fn dispatch_leased(
        &self,
        grant: LeaseGrant,
        request: RpcRequest,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> ArbiterResult<Vec<LuaValue>> {
        let result = match cancel.as_mut() {
            Some(rx) => {
                tokio::select! {
                    res = grant.instance.dispatch(request) => res,
                    _ = canceled(rx) => Err(ArbiterError::Canceled),
                }
            }
            None => grant.instance.dispatch(request).await,
        };
        // The lease ends here no matter how the call went.
        let _ = self.release(grant.instance.id()).await;
        let response = result?;
        Ok(response.result.unwrap_or_default())
    }

    /// Spawns the background populator tasks that keep
    /// `ready_instances_to_keep_in_reserve` warm instances available.
    pub fn start_populator(&self) {
        for worker in 0..self.config.populate_ready_instance_threads {
            let pool = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                debug!(worker, "populator task started");
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    let pause = match pool.populate_once().await {
                        // Reserve still short; go again immediately.
                        Ok(true) => continue,
                        Ok(false) => pool.config.populate_interval,
                        Err(err) => {
                            warn!(worker, %err, "populator start failed, backing off");
                            pool.config.populate_interval * 4
                        }
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }
    }

    /// One populator pass: reap ready slots whose worker died, then start
    /// an instance when the reserve is short and capacity allows. Returns
    /// whether an instance was started.
    async fn populate_once(&self) -> ArbiterResult<bool> {
        self.reap_dead_instances().await;
        if self.count_ready().await >= self.config.ready_instances_to_keep_in_reserve {
            return Ok(false);
        }
        match self.try_start_instance().await? {
            Some(slot) => {
                debug!(instance_id = slot.id(), "reserve instance started");
                self.ready.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes ready slots whose worker process has exited. The slot is
    /// marked Faulted under its lock first so no caller can claim it
    /// between the liveness check and the removal.
    async fn reap_dead_instances(&self) {
        let slots: Vec<Arc<InstanceSlot>> = {
            let state = self.state.lock().unwrap();
            state.slots.values().cloned().collect()
        };
        for slot in slots {
            let dead = {
                let mut inner = slot.inner.lock().await;
                if inner.state != InstanceState::Ready {
                    continue;
                }
                let exited = match inner.worker.as_mut() {
                    Some(worker) => {
                        matches!(self.lifecycle.is_alive(worker), Liveness::Exited)
                    }
                    None => false,
                };
                if exited {
                    inner.state = InstanceState::Faulted;
                }
                exited
            };
            if dead {
                warn!(instance_id = slot.id(), "ready worker exited, reaping");
                self.remove_and_kill(&slot).await;
                // Fresh-start capacity opened up.
                self.ready.notify_one();
            }
        }
    }

    async fn count_ready(&self) -> usize {
        let slots: Vec<Arc<InstanceSlot>> = {
            let state = self.state.lock().unwrap();
            state.slots.values().cloned().collect()
        };
        let mut ready = 0;
        for slot in slots {
            if slot.inner.lock().await.state == InstanceState::Ready {
                ready += 1;
            }
        }
        ready
    }

    /// Best-effort kill of every tracked instance, leased or not. Clears
    /// the pool and never fails; intended as the shutdown hook.
    pub async fn kill_all_instances(&self) {
        let slots: Vec<Arc<InstanceSlot>> = {
            let mut state = self.state.lock().unwrap();
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        info!(instances = slots.len(), "killing all instances");
        for slot in slots {
            // Slot is already out of the map, so the lease-end listener
            // becomes a no-op; settle the books directly.
            let _ = self.leases.release(slot.id());
            if let Some(subscription) = slot.subscription.get() {
                self.leases.unsubscribe(slot.id(), *subscription);
            }
            let worker = {
                let mut inner = slot.inner.lock().await;
                if inner.state == InstanceState::Leased {
                    self.resources.release(&inner.declared);
                    inner.declared = GridServerResource::none();
                }
                inner.worker.take()
            };
            if let Some(mut worker) = worker {
                let outcome = self.lifecycle.kill(&mut worker).await;
                debug!(instance_id = slot.id(), ?outcome, "instance killed");
            }
        }
    }

    /// Stops the populator tasks and kills every instance.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.kill_all_instances().await;
    }
}

/// Resolves when the sender flips the flag to true. Never resolves when the
/// sender is dropped without canceling.
async fn canceled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
