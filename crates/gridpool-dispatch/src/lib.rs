//! gridpool-dispatch — the RPC dispatch pipeline for worker calls.
//!
//! Every RPC into a worker instance flows through an ordered handler chain:
//! metrics recording → circuit breaker → transport send. Handlers share an
//! execution context and may short-circuit by not invoking the rest of the
//! chain.
//!
//! # Components
//!
//! - **`pipeline`** — the mutable handler chain and execution context
//! - **`handlers`** — the metrics, circuit-breaker, and send handlers
//! - **`transport`** — per-request hyper HTTP/1 JSON transport

pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod transport;

pub use error::DispatchError;
pub use handlers::{CircuitBreakerHandler, DispatchMetrics, MetricsHandler, SendHandler};
pub use pipeline::{Endpoint, ExecutionContext, Handler, HandlerFuture, Next, Pipeline};
pub use transport::HttpTransport;
