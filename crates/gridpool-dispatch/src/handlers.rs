//! The handlers the pool wires into its dispatch pipeline.
//!
//! Invocation order: metrics recording → circuit breaker → transport send.
//! The breaker handler consults the policy before forwarding and reports
//! the outcome back; the send handler retries transport-level failures
//! with exponential backoff before giving up.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use gridpool_sentinel::{Backoff, CircuitBreaker, TripReasonAuthority};

use crate::error::DispatchError;
use crate::pipeline::{ExecutionContext, Handler, HandlerFuture, Next};
use crate::transport::HttpTransport;

/// Counters shared between the metrics handler and its readers.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub total_latency_us: AtomicU64,
}

impl DispatchMetrics {
    /// (requests, failures, total latency in µs) snapshot.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.total_latency_us.load(Ordering::Relaxed),
        )
    }
}

/// Records request counts and latency around the rest of the chain.
pub struct MetricsHandler {
    metrics: Arc<DispatchMetrics>,
}

impl MetricsHandler {
    pub fn new(metrics: Arc<DispatchMetrics>) -> Self {
        Self { metrics }
    }
}

impl Handler for MetricsHandler {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn type_key(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            self.metrics.requests.fetch_add(1, Ordering::Relaxed);

            let result = next.run(ctx).await;

            self.metrics
                .total_latency_us
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            if result.is_err() {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
            result
        })
    }
}

/// Gates the chain on a circuit breaker and reports outcomes back to it.
pub struct CircuitBreakerHandler {
    breaker: Arc<CircuitBreaker>,
    authority: Arc<dyn TripReasonAuthority<DispatchError>>,
}

impl CircuitBreakerHandler {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        authority: Arc<dyn TripReasonAuthority<DispatchError>>,
    ) -> Self {
        Self { breaker, authority }
    }

    /// Handler with the default classification (transport failures trip).
    pub fn with_default_authority(breaker: Arc<CircuitBreaker>) -> Self {
        Self::new(breaker, Arc::new(DispatchError::is_transport_failure))
    }
}

impl Handler for CircuitBreakerHandler {
    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    fn type_key(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.breaker.check()?;

            let result = next.run(ctx).await;
            match &result {
                Ok(()) => self.breaker.record_success(),
                Err(error) => {
                    // Non-qualifying errors leave breaker state untouched.
                    if self.authority.is_trip_worthy(error) {
                        warn!(
                            breaker = self.breaker.name(),
                            %error,
                            "trip-worthy dispatch failure"
                        );
                        self.breaker.record_failure();
                    }
                }
            }
            result
        })
    }
}

/// Terminal handler: posts the request to the worker, retrying transport
/// failures with exponential backoff.
pub struct SendHandler {
    transport: HttpTransport,
    backoff: Backoff,
}

impl SendHandler {
    pub fn new(transport: HttpTransport, backoff: Backoff) -> Self {
        Self { transport, backoff }
    }
}

impl Handler for SendHandler {
    fn name(&self) -> &'static str {
        "send"
    }

    fn type_key(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut attempt = 1u32;
            let envelope = loop {
                match self.transport.send(&ctx.endpoint, &ctx.request).await {
                    Ok(envelope) => break envelope,
                    Err(error) => {
                        if !error.is_transport_failure() || attempt >= self.backoff.max_attempts {
                            return Err(error);
                        }
                        let delay = self.backoff.delay_for(attempt);
                        debug!(
                            endpoint = %ctx.endpoint.address(),
                            attempt,
                            ?delay,
                            %error,
                            "transport failure, backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            };

            if let Some(message) = &envelope.error {
                let message = message.clone();
                ctx.response = Some(envelope);
                return Err(DispatchError::Rpc(message));
            }

            ctx.response = Some(envelope);
            next.run(ctx).await
        })
    }
}
