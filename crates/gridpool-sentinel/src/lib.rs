//! gridpool-sentinel — fault-tolerance guards for calls into workers.
//!
//! Worker processes crash, hang, and run untrusted scripts, so every RPC
//! into one passes through a circuit breaker, and transport-level retries
//! are spaced by exponential backoff.
//!
//! # Components
//!
//! - **`breaker`** — per-endpoint circuit breaker with a pluggable
//!   trip-reason classifier
//! - **`backoff`** — exponential backoff with optional full/equal jitter

pub mod backoff;
pub mod breaker;

pub use backoff::{calculate_backoff, Backoff, Jitter};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, SentinelError, TripReasonAuthority};
