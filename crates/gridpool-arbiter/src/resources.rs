//! Capacity accounting for leased instances.
//!
//! Every lease declares the resources it intends to consume up front. The
//! tracker admits or rejects the declaration against per-pool totals and
//! keeps a running tally so releases restore capacity exactly.

use std::sync::Mutex;

use tracing::debug;

/// Resources a caller declares it will consume for the duration of a lease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridServerResource {
    pub cores: f64,
    pub threads: u64,
    pub memory_bytes: u64,
}

impl GridServerResource {
    pub const fn none() -> Self {
        Self {
            cores: 0.0,
            threads: 0,
            memory_bytes: 0,
        }
    }
}

impl Default for GridServerResource {
    fn default() -> Self {
        Self::none()
    }
}

/// Why a resource declaration was refused. Checks run in a fixed order
/// (cpu, then threads, then memory) so a declaration that exceeds several
/// dimensions always reports the same reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    CpuAllocationExceeded,
    ThreadsAllocationExceeded,
    MemoryAllocationExceeded,
}

/// Per-pool capacity totals and admission knobs.
///
/// A dimension with its `enforce_*` flag cleared never rejects. The
/// over-allocation ratios let a pool deliberately oversubscribe a dimension
/// relative to its physical total.
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub total_cores: f64,
    pub total_threads: u64,
    pub total_memory_bytes: u64,
    pub enforce_cpu: bool,
    pub enforce_threads: bool,
    pub enforce_memory: bool,
    pub cpu_over_allocation_ratio: f64,
    pub threads_over_allocation_ratio: f64,
    pub memory_over_allocation_ratio: f64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            total_cores: num_cpus_guess(),
            total_threads: 4096,
            total_memory_bytes: 8 * 1024 * 1024 * 1024,
            enforce_cpu: true,
            enforce_threads: true,
            enforce_memory: true,
            cpu_over_allocation_ratio: 1.0,
            threads_over_allocation_ratio: 1.0,
            memory_over_allocation_ratio: 1.0,
        }
    }
}

fn num_cpus_guess() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

#[derive(Debug, Default)]
struct InUse {
    cores: f64,
    threads: u64,
    memory_bytes: u64,
}

/// Tracks resource declarations against [`ResourceSettings`].
#[derive(Debug)]
pub struct ResourceAllocationTracker {
    settings: ResourceSettings,
    in_use: Mutex<InUse>,
}

impl ResourceAllocationTracker {
    pub fn new(settings: ResourceSettings) -> Self {
        Self {
            settings,
            in_use: Mutex::new(InUse::default()),
        }
    }

    /// Admits or rejects a declaration. On success the declared amounts are
    /// committed atomically across all dimensions.
    pub fn try_allocate(&self, resource: &GridServerResource) -> Result<(), RejectionReason> {
        let mut in_use = self.in_use.lock().unwrap();

        if self.settings.enforce_cpu {
            let cap = self.settings.total_cores * self.settings.cpu_over_allocation_ratio;
            if in_use.cores + resource.cores > cap {
                return Err(RejectionReason::CpuAllocationExceeded);
            }
        }
        if self.settings.enforce_threads {
            let cap = (self.settings.total_threads as f64
                * self.settings.threads_over_allocation_ratio) as u64;
            if in_use.threads + resource.threads > cap {
                return Err(RejectionReason::ThreadsAllocationExceeded);
            }
        }
        if self.settings.enforce_memory {
            let cap = (self.settings.total_memory_bytes as f64
                * self.settings.memory_over_allocation_ratio) as u64;
            if in_use.memory_bytes + resource.memory_bytes > cap {
                return Err(RejectionReason::MemoryAllocationExceeded);
            }
        }

        in_use.cores += resource.cores;
        in_use.threads += resource.threads;
        in_use.memory_bytes += resource.memory_bytes;
        debug!(
            cores = in_use.cores,
            threads = in_use.threads,
            memory_bytes = in_use.memory_bytes,
            "resources allocated"
        );
        Ok(())
    }

    /// Returns a previous declaration's amounts to the pool. Saturates at
    /// zero so a stray double-release cannot poison the tally.
    pub fn release(&self, resource: &GridServerResource) {
        let mut in_use = self.in_use.lock().unwrap();
        in_use.cores = (in_use.cores - resource.cores).max(0.0);
        in_use.threads = in_use.threads.saturating_sub(resource.threads);
        in_use.memory_bytes = in_use.memory_bytes.saturating_sub(resource.memory_bytes);
    }

    pub fn in_use(&self) -> GridServerResource {
        let in_use = self.in_use.lock().unwrap();
        GridServerResource {
            cores: in_use.cores,
            threads: in_use.threads,
            memory_bytes: in_use.memory_bytes,
        }
    }
}
