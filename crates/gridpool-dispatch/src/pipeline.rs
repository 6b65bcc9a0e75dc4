//! The ordered, mutable handler chain.
//!
//! A `Pipeline` holds handlers in invocation order. Each handler receives
//! the shared `ExecutionContext` and a `Next` continuation; invoking the
//! continuation runs the rest of the chain, and skipping it short-circuits.
//! Handlers are addressed by type for insertion and removal.

use std::any::TypeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gridpool_wire::{RpcRequest, RpcResponse};

use crate::error::DispatchError;

/// A worker RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn localhost(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared state threaded through the handler chain.
#[derive(Debug)]
pub struct ExecutionContext {
    pub endpoint: Endpoint,
    pub request: RpcRequest,
    pub response: Option<RpcResponse>,
}

impl ExecutionContext {
    pub fn new(endpoint: Endpoint, request: RpcRequest) -> Self {
        Self {
            endpoint,
            request,
            response: None,
        }
    }
}

/// The boxed future returned by handler invocations.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;

/// One link in the chain.
pub trait Handler: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The concrete type id, used for positional insertion and removal.
    fn type_key(&self) -> TypeId;

    fn invoke<'a>(&'a self, ctx: &'a mut ExecutionContext, next: Next<'a>) -> HandlerFuture<'a>;
}

/// Continuation over the remaining handlers.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Handler>],
}

impl<'a> Next<'a> {
    /// Run the rest of the chain. With no handlers left this resolves `Ok`,
    /// leaving whatever the last handler wrote in the context.
    pub fn run(self, ctx: &'a mut ExecutionContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((handler, rest)) => handler.invoke(ctx, Next { rest }).await,
                None => Ok(()),
            }
        })
    }
}

/// The ordered handler chain.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler at the end of the chain.
    pub fn append_handler(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// Insert a handler at the front of the chain.
    pub fn prepend_handler(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(0, handler);
        self
    }

    /// Insert a handler immediately before the handler of type `T`.
    /// Returns false (without inserting) when `T` is not in the chain.
    pub fn add_handler_before<T: Handler>(&mut self, handler: Arc<dyn Handler>) -> bool {
        match self.position_of::<T>() {
            Some(index) => {
                self.handlers.insert(index, handler);
                true
            }
            None => false,
        }
    }

    /// Insert a handler immediately after the handler of type `T`.
    pub fn add_handler_after<T: Handler>(&mut self, handler: Arc<dyn Handler>) -> bool {
        match self.position_of::<T>() {
            Some(index) => {
                self.handlers.insert(index + 1, handler);
                true
            }
            None => false,
        }
    }

    /// Remove the handler of type `T`. Returns false when absent.
    pub fn remove_handler<T: Handler>(&mut self) -> bool {
        match self.position_of::<T>() {
            Some(index) => {
                self.handlers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Handler names in invocation order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the chain over a context.
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), DispatchError> {
        Next {
            rest: &self.handlers,
        }
        .run(ctx)
        .await
    }

    /// Run the chain and require that some handler produced a response.
    pub async fn dispatch(
        &self,
        endpoint: Endpoint,
        request: RpcRequest,
    ) -> Result<RpcResponse, DispatchError> {
        let mut ctx = ExecutionContext::new(endpoint, request);
        self.execute(&mut ctx).await?;
        ctx.response.ok_or(DispatchError::NoResponse)
    }

    fn position_of<T: Handler>(&self) -> Option<usize> {
        let key = TypeId::of::<T>();
        self.handlers.iter().position(|h| h.type_key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridpool_wire::{ExecuteRequest, LuaValue, ScriptExecution};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> RpcRequest {
        RpcRequest::Execute(ExecuteRequest {
            job_id: "job".to_string(),
            script: ScriptExecution::new("s", "return 1"),
        })
    }

    /// Records invocation order into a shared log.
    struct Recorder {
        tag: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Handler for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }
        fn type_key(&self) -> TypeId {
            TypeId::of::<Self>()
        }
        fn invoke<'a>(
            &'a self,
            ctx: &'a mut ExecutionContext,
            next: Next<'a>,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push(self.tag);
                next.run(ctx).await
            })
        }
    }

    /// Terminal handler that writes a canned response.
    struct Responder;

    impl Handler for Responder {
        fn name(&self) -> &'static str {
            "responder"
        }
        fn type_key(&self) -> TypeId {
            TypeId::of::<Self>()
        }
        fn invoke<'a>(
            &'a self,
            ctx: &'a mut ExecutionContext,
            next: Next<'a>,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                ctx.response = Some(RpcResponse::ok(vec![LuaValue::number(1.0)]));
                next.run(ctx).await
            })
        }
    }

    /// Short-circuits by never invoking the continuation.
    struct Blocker;

    impl Handler for Blocker {
        fn name(&self) -> &'static str {
            "blocker"
        }
        fn type_key(&self) -> TypeId {
            TypeId::of::<Self>()
        }
        fn invoke<'a>(
            &'a self,
            _ctx: &'a mut ExecutionContext,
            _next: Next<'a>,
        ) -> HandlerFuture<'a> {
            Box::pin(async move { Ok(()) })
        }
    }

    /// Counts how often it runs; used behind the blocker.
    struct Counter {
        hits: Arc<AtomicUsize>,
    }

    impl Handler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn type_key(&self) -> TypeId {
            TypeId::of::<Self>()
        }
        fn invoke<'a>(
            &'a self,
            ctx: &'a mut ExecutionContext,
            next: Next<'a>,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.hits.fetch_add(1, Ordering::SeqCst);
                next.run(ctx).await
            })
        }
    }

    #[tokio::test]
    async fn handlers_run_in_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .append_handler(Arc::new(Recorder {
                tag: "first",
                log: log.clone(),
            }))
            .append_handler(Arc::new(Responder));

        let response = pipeline
            .dispatch(Endpoint::localhost(1), request())
            .await
            .unwrap();
        assert!(response.result.is_some());
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_later_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline
            .append_handler(Arc::new(Blocker))
            .append_handler(Arc::new(Counter { hits: hits.clone() }));

        let result = pipeline.dispatch(Endpoint::localhost(1), request()).await;
        assert!(matches!(result, Err(DispatchError::NoResponse)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn positional_insertion_and_removal() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.append_handler(Arc::new(Responder));

        assert!(pipeline.add_handler_before::<Responder>(Arc::new(Counter { hits: hits.clone() })));
        assert_eq!(pipeline.handler_names(), vec!["counter", "responder"]);

        assert!(pipeline.add_handler_after::<Counter>(Arc::new(Blocker)));
        assert_eq!(
            pipeline.handler_names(),
            vec!["counter", "blocker", "responder"]
        );

        assert!(pipeline.remove_handler::<Blocker>());
        assert_eq!(pipeline.handler_names(), vec!["counter", "responder"]);

        assert!(!pipeline.remove_handler::<Blocker>());
        assert!(!pipeline.add_handler_before::<Blocker>(Arc::new(Responder)));
    }

    #[tokio::test]
    async fn prepend_puts_handler_first() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.append_handler(Arc::new(Responder));
        pipeline.prepend_handler(Arc::new(Counter { hits }));
        assert_eq!(pipeline.handler_names(), vec!["counter", "responder"]);
    }

    #[tokio::test]
    async fn empty_pipeline_yields_no_response() {
        let pipeline = Pipeline::new();
        let result = pipeline.dispatch(Endpoint::localhost(1), request()).await;
        assert!(matches!(result, Err(DispatchError::NoResponse)));
    }
}
