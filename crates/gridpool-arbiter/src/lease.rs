//! Lease bookkeeping with expiration notification.
//!
//! A lease is a time-boxed claim on a single instance. The registry tracks
//! the authoritative expiry for each leased instance, lets callers renew or
//! release early, and notifies subscribed listeners exactly once per lease
//! end, whether the lease expired on its own or was released explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Opaque handle returned by [`LeaseRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Snapshot of an active lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub instance_id: String,
    /// Identity of this grant, stable across renewals. Listeners receive it
    /// so a slow consumer can tell which lease actually ended.
    pub epoch: u64,
    pub duration: Duration,
    pub expires_at: Instant,
}

/// Called with the instance id and the epoch of the lease that ended.
type LeaseListener = Arc<dyn Fn(&str, u64) + Send + Sync>;

struct LeaseEntry {
    /// Distinguishes grants for the same instance id. Each grant spawns its
    /// own watcher task; a task whose epoch no longer matches the entry
    /// belongs to an earlier grant and must exit without firing.
    epoch: u64,
    duration: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct RegistryInner {
    leases: HashMap<String, LeaseEntry>,
    listeners: HashMap<String, Vec<(SubscriptionId, LeaseListener)>>,
    next_epoch: u64,
    next_subscription: u64,
}

/// Tracks active leases and fires end-of-lease listeners.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a lease on `instance_id` for `duration`. Replaces any existing
    /// lease on the same instance without firing its listeners.
    pub fn grant(&self, instance_id: &str, duration: Duration) -> Lease {
        let expires_at = Instant::now() + duration;
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_epoch += 1;
            let epoch = inner.next_epoch;
            inner.leases.insert(
                instance_id.to_owned(),
                LeaseEntry {
                    epoch,
                    duration,
                    expires_at,
                },
            );
            epoch
        };
        debug!(instance_id, ?duration, "lease granted");
        self.spawn_watcher(instance_id.to_owned(), epoch);
        Lease {
            instance_id: instance_id.to_owned(),
            epoch,
            duration,
            expires_at,
        }
    }

    /// Extends the lease by its original duration from now. Fails when the
    /// instance holds no active lease.
    pub fn renew(&self, instance_id: &str) -> Option<Lease> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.leases.get_mut(instance_id)?;
        entry.expires_at = Instant::now() + entry.duration;
        debug!(instance_id, "lease renewed");
        Some(Lease {
            instance_id: instance_id.to_owned(),
            epoch: entry.epoch,
            duration: entry.duration,
            expires_at: entry.expires_at,
        })
    }

    /// Ends the lease now, firing listeners. Returns the ended lease's
    /// epoch, or `None` when the instance held no active lease.
    pub fn release(&self, instance_id: &str) -> Option<u64> {
        let (epoch, fired) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner.leases.remove(instance_id)?;
            (entry.epoch, Self::listeners_for(&inner, instance_id))
        };
        debug!(instance_id, "lease released");
        for listener in fired {
            listener(instance_id, epoch);
        }
        Some(epoch)
    }

    pub fn is_leased(&self, instance_id: &str) -> bool {
        self.inner.lock().unwrap().leases.contains_key(instance_id)
    }

    pub fn lease_info(&self, instance_id: &str) -> Option<Lease> {
        let inner = self.inner.lock().unwrap();
        inner.leases.get(instance_id).map(|e| Lease {
            instance_id: instance_id.to_owned(),
            epoch: e.epoch,
            duration: e.duration,
            expires_at: e.expires_at,
        })
    }

    /// Registers a listener for lease end on `instance_id`. Listeners persist
    /// across grants until unsubscribed.
    pub fn subscribe(
        &self,
        instance_id: &str,
        listener: impl Fn(&str, u64) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner
            .listeners
            .entry(instance_id.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, instance_id: &str, subscription: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.listeners.get_mut(instance_id) {
            list.retain(|(id, _)| *id != subscription);
            if list.is_empty() {
                inner.listeners.remove(instance_id);
            }
        }
    }

    /// Listeners currently registered for an instance id.
    pub fn listener_count(&self, instance_id: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.listeners.get(instance_id).map_or(0, Vec::len)
    }

    fn listeners_for(inner: &RegistryInner, instance_id: &str) -> Vec<LeaseListener> {
        inner
            .listeners
            .get(instance_id)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// One watcher task per grant. The task re-arms after renewals and exits
    /// silently when the lease was released or superseded by a newer grant.
    fn spawn_watcher(&self, instance_id: String, epoch: u64) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let inner = registry.inner.lock().unwrap();
                    match inner.leases.get(&instance_id) {
                        Some(entry) if entry.epoch == epoch => entry.expires_at,
                        _ => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let fired = {
                    let mut inner = registry.inner.lock().unwrap();
                    match inner.leases.get(&instance_id) {
                        Some(entry) if entry.epoch == epoch => {
                            if entry.expires_at > Instant::now() {
                                // Renewed while we slept.
                                continue;
                            }
                            inner.leases.remove(&instance_id);
                            Self::listeners_for(&inner, &instance_id)
                        }
                        _ => return,
                    }
                };
                debug!(instance_id, "lease expired");
                for listener in fired {
                    listener(&instance_id, epoch);
                }
                return;
            }
        });
    }
}
