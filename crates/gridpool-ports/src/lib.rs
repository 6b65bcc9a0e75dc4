//! gridpool-ports — race-free TCP port assignment for starting workers.
//!
//! Several worker processes may start concurrently, and each must be handed
//! a port no other starter can receive before the worker binds it. The
//! allocator keeps a reservation cache and performs the probe-and-reserve
//! step inside a single critical section per call, so two starters can
//! never pick the same port between probe and reservation.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::ops::Range;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port found in {range:?} after {attempts} attempts ({elapsed_ms} ms)")]
    Timeout {
        range: Range<u16>,
        attempts: u32,
        elapsed_ms: u128,
    },
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// Half-open port range to scan.
    pub range: Range<u16>,
    /// Candidate probes per `find_next_available_port` call before timing out.
    pub max_attempts: u32,
    /// How long a handed-out port stays reserved if never explicitly released.
    pub reservation_hold: Duration,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            range: 45000..47000,
            max_attempts: 1000,
            reservation_hold: Duration::from_secs(30),
        }
    }
}

/// Finds and reserves free TCP ports for concurrently starting workers.
pub struct PortAllocator {
    config: PortAllocatorConfig,
    /// Port → reservation instant. Guards the probe-and-reserve step.
    reserved: Mutex<HashMap<u16, Instant>>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            config,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Scan the configured range for a free, unreserved port and reserve it.
    ///
    /// Candidates are drawn at random from the range; each is skipped if a
    /// live reservation exists, then bind-probed on the loopback interface.
    /// The first candidate that passes both checks is reserved and returned.
    pub fn find_next_available_port(&self) -> Result<u16, PortError> {
        let started = Instant::now();
        let mut reserved = self.reserved.lock().expect("port reservation lock");

        for attempt in 0..self.config.max_attempts {
            let port = self.pick_candidate();

            match reserved.get(&port) {
                Some(at) if at.elapsed() < self.config.reservation_hold => {
                    debug!(port, "candidate port reserved recently, skipping");
                    continue;
                }
                Some(_) => {
                    // Stale reservation from a starter that never released it.
                    reserved.remove(&port);
                }
                None => {}
            }

            if !probe_bind(port) {
                warn!(port, "candidate port already in use");
                continue;
            }

            reserved.insert(port, Instant::now());
            info!(
                port,
                attempts = attempt + 1,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "port chosen for next worker instance"
            );
            return Ok(port);
        }

        Err(PortError::Timeout {
            range: self.config.range.clone(),
            attempts: self.config.max_attempts,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Evict a reservation once the owning process is confirmed exited.
    pub fn remove_port_from_cache_if_exists(&self, port: u16) {
        let mut reserved = self.reserved.lock().expect("port reservation lock");
        if reserved.remove(&port).is_some() {
            debug!(port, "port reservation released");
        }
    }

    /// Number of live reservations.
    pub fn reserved_count(&self) -> usize {
        let reserved = self.reserved.lock().expect("port reservation lock");
        reserved
            .values()
            .filter(|at| at.elapsed() < self.config.reservation_hold)
            .count()
    }

    fn pick_candidate(&self) -> u16 {
        let range = &self.config.range;
        if range.len() <= 1 {
            return range.start;
        }
        rand::thread_rng().gen_range(range.start..range.end)
    }
}

/// Bind-and-release probe on loopback. True if the port is currently free.
fn probe_bind(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator(range: Range<u16>, max_attempts: u32) -> PortAllocator {
        PortAllocator::new(PortAllocatorConfig {
            range,
            max_attempts,
            reservation_hold: Duration::from_secs(30),
        })
    }

    #[test]
    fn allocates_distinct_ports() {
        let alloc = allocator(61000..61016, 200);
        let mut seen = HashSet::new();
        for _ in 0..8 {
            let port = alloc.find_next_available_port().unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn concurrent_starters_never_collide() {
        let alloc = Arc::new(allocator(61100..61132, 500));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                alloc.find_next_available_port().unwrap()
            }));
        }
        let ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn exhausted_range_times_out() {
        let alloc = allocator(61200..61204, 50);
        for _ in 0..4 {
            alloc.find_next_available_port().unwrap();
        }
        assert!(matches!(
            alloc.find_next_available_port(),
            Err(PortError::Timeout { .. })
        ));
    }

    #[test]
    fn eviction_frees_the_port() {
        let alloc = allocator(61300..61301, 20);
        let port = alloc.find_next_available_port().unwrap();
        assert!(alloc.find_next_available_port().is_err());

        alloc.remove_port_from_cache_if_exists(port);
        assert_eq!(alloc.find_next_available_port().unwrap(), port);
    }

    #[test]
    fn bound_port_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = listener.local_addr().unwrap().port();

        let alloc = allocator(bound..bound + 1, 10);
        assert!(alloc.find_next_available_port().is_err());
    }

    #[test]
    fn stale_reservations_lapse() {
        let alloc = PortAllocator::new(PortAllocatorConfig {
            range: 61400..61401,
            max_attempts: 10,
            reservation_hold: Duration::from_millis(10),
        });
        let port = alloc.find_next_available_port().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(alloc.find_next_available_port().unwrap(), port);
    }
}
