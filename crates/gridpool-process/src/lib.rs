//! gridpool-process — lifecycle management for worker OS processes.
//!
//! Workers are heavyweight external processes that take a listening port as
//! a start argument. This crate spawns them, gates readiness on a TCP
//! health probe with a bounded attempt ceiling, and terminates them with
//! confirm semantics that never block the pool's forward progress.

pub mod manager;

pub use manager::{
    Liveness, ProcessError, ProcessLifecycleManager, ProcessSettings, TerminateOutcome,
    WorkerProcess,
};
