//! gridpool-arbiter — the leased instance pool.
//!
//! Composes the port allocator, process lifecycle manager, lease registry,
//! and dispatch pipeline into the single entry point callers use: acquire a
//! leased worker instance, execute scripts against it, and return it to the
//! pool (or kill it once its reuse cap is spent).
//!
//! The pool is an explicitly constructed object with no global state; the
//! embedding application decides its lifetime and tests build independent
//! pools freely.

pub mod config;
pub mod error;
pub mod instance;
pub mod lease;
pub mod pool;
pub mod resources;

pub use config::ArbiterConfig;
pub use error::{ArbiterError, ArbiterResult};
pub use instance::{InstanceSlot, InstanceState};
pub use lease::{Lease, LeaseRegistry, SubscriptionId};
pub use pool::{InstancePool, LeaseGrant};
pub use resources::{GridServerResource, RejectionReason, ResourceAllocationTracker, ResourceSettings};
