//! Pool-level configuration.

use std::time::Duration;

use gridpool_sentinel::{Backoff, CircuitBreakerConfig};

/// Tunables for an [`crate::InstancePool`].
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Hard cap on concurrently running instances, counting in-flight spawns.
    pub max_instances: usize,
    /// Number of leases an instance may serve before it is retired.
    pub max_instance_reuses: u32,
    /// Warm reserve the populator tries to keep ready at all times.
    pub ready_instances_to_keep_in_reserve: usize,
    /// Concurrent populator tasks.
    pub populate_ready_instance_threads: usize,
    /// Sleep between populator passes.
    pub populate_interval: Duration,
    /// Lease duration applied when a caller does not name one.
    pub default_lease: Duration,
    /// How long `acquire` waits for an instance to become ready.
    /// Zero means fail immediately when nothing is ready.
    pub acquire_timeout: Duration,
    /// Per-call RPC timeout on the dispatch transport.
    pub rpc_timeout: Duration,
    /// Per-instance circuit breaker settings.
    pub breaker: CircuitBreakerConfig,
    /// Retry schedule for transport-level send failures.
    pub backoff: Backoff,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            max_instance_reuses: 10,
            ready_instances_to_keep_in_reserve: 5,
            populate_ready_instance_threads: 2,
            populate_interval: Duration::from_millis(250),
            default_lease: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(20),
            breaker: CircuitBreakerConfig::default(),
            backoff: Backoff::default(),
        }
    }
}
