//! Service descriptors, the method registry, and inbound request dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wsrpc_wire::Frame;

use crate::context::CallContext;
use crate::error::RpcError;

/// Future returned by a method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>>;

/// Handler entry point emitted by the stub generator for each method.
pub type HandlerFn<S> = fn(Arc<S>, CallContext, Vec<u8>) -> HandlerFuture;

/// Error a handler returns. Its message travels to the caller in an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::new(err.to_string())
    }
}

/// One method of a service.
pub struct MethodDesc<S: ?Sized + 'static> {
    pub method_name: &'static str,
    pub handler: HandlerFn<S>,
}

/// Static description of a service, emitted by the stub generator.
pub struct ServiceDesc<S: ?Sized + 'static> {
    pub service_name: &'static str,
    pub methods: &'static [MethodDesc<S>],
}

impl<S: ?Sized + 'static> ServiceDesc<S> {
    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.iter().map(|m| m.method_name)
    }
}

/// Anything that accepts service registrations: servers and clients alike.
pub trait ServiceRegistrar {
    fn register_service<S>(&self, desc: &ServiceDesc<S>, service: Arc<S>) -> Result<(), RpcError>
    where
        S: ?Sized + Send + Sync + 'static;
}

type BoundHandler = Arc<dyn Fn(CallContext, Vec<u8>) -> HandlerFuture + Send + Sync>;

struct RegisteredMethod {
    service: &'static str,
    handler: BoundHandler,
}

/// Method name → handler bound to its service implementation.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, RegisteredMethod>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of `desc`. Nothing is registered if any
    /// method name is already taken.
    pub fn register<S>(&mut self, desc: &ServiceDesc<S>, service: Arc<S>) -> Result<(), RpcError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let mut seen = std::collections::HashSet::new();
        for name in desc.method_names() {
            if let Some(existing) = self.methods.get(name) {
                return Err(RpcError::Registration(format!(
                    "method {name} of {} already registered by {}",
                    desc.service_name, existing.service
                )));
            }
            if !seen.insert(name) {
                return Err(RpcError::Registration(format!(
                    "method {name} declared twice in {}",
                    desc.service_name
                )));
            }
        }

        for method in desc.methods {
            let service = Arc::clone(&service);
            let handler = method.handler;
            self.methods.insert(
                method.method_name.to_string(),
                RegisteredMethod {
                    service: desc.service_name,
                    handler: Arc::new(move |ctx, payload| handler(Arc::clone(&service), ctx, payload)),
                },
            );
        }
        Ok(())
    }

    fn lookup(&self, method: &str) -> Option<BoundHandler> {
        self.methods.get(method).map(|m| Arc::clone(&m.handler))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Shared registry of one endpoint, consulted by each of its connections.
#[derive(Default)]
pub(crate) struct Dispatcher {
    registry: RwLock<ServiceRegistry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S>(&self, desc: &ServiceDesc<S>, service: Arc<S>) -> Result<(), RpcError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.register(desc, service)?;
        debug!(service = desc.service_name, methods = registry.len(), "Service registered");
        Ok(())
    }

    /// Run one inbound request on its own task and queue the reply frame.
    pub fn spawn_request(
        self: &Arc<Self>,
        ctx: CallContext,
        id: u64,
        method: String,
        payload: Vec<u8>,
        replies: mpsc::Sender<Frame>,
    ) {
        let handler = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lookup(&method);

        tokio::spawn(async move {
            let reply = match handler {
                None => {
                    debug!(id, method = %method, "Unknown method");
                    Frame::Error {
                        id,
                        message: format!("method not found: {method}"),
                    }
                }
                Some(handler) => match run_handler(handler, ctx, payload).await {
                    Ok(payload) => Frame::Response { id, payload },
                    Err(e) => Frame::Error {
                        id,
                        message: e.message,
                    },
                },
            };
            if replies.send(reply).await.is_err() {
                debug!(id, method = %method, "Connection closed before reply was sent");
            }
        });
    }
}

/// Invoke a handler, turning a panic into a handler error.
async fn run_handler(
    handler: BoundHandler,
    ctx: CallContext,
    payload: Vec<u8>,
) -> Result<Vec<u8>, HandlerError> {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, payload))) {
        Ok(fut) => fut,
        Err(_) => {
            warn!("Handler panicked before returning a future");
            return Err(HandlerError::new("handler panicked"));
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("Handler panicked");
            Err(HandlerError::new("handler panicked"))
        }
    }
}
