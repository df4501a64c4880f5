//! The `Echo` service: stubs in the shape the stub generator emits, plus a
//! reference implementation used by the CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_payload, encode_payload};
use crate::context::CallContext;
use crate::dispatch::{HandlerError, HandlerFuture, MethodDesc, ServiceDesc, ServiceRegistrar};
use crate::error::RpcError;
use crate::invoker::{invoke, Invoker};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub body: String,
    /// Handler sleeps this long before answering.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub body: String,
}

/// Client stub for the Echo service.
#[derive(Debug, Clone)]
pub struct EchoClient<I> {
    cc: I,
}

impl<I: Invoker> EchoClient<I> {
    pub fn new(cc: I) -> Self {
        Self { cc }
    }

    pub async fn echo(&self, ctx: &CallContext, request: &EchoRequest) -> Result<EchoResponse, RpcError> {
        invoke(&self.cc, ctx, "Echo", request).await
    }
}

/// Server-side interface of the Echo service.
#[async_trait]
pub trait EchoServer: Send + Sync + 'static {
    async fn echo(&self, ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, HandlerError>;
}

pub fn register_echo_server<R: ServiceRegistrar>(
    registrar: &R,
    service: Arc<dyn EchoServer>,
) -> Result<(), RpcError> {
    registrar.register_service(&ECHO_SERVICE_DESC, service)
}

fn echo_echo_handler(srv: Arc<dyn EchoServer>, ctx: CallContext, payload: Vec<u8>) -> HandlerFuture {
    Box::pin(async move {
        let request: EchoRequest = decode_payload(&payload)?;
        let response = srv.echo(ctx, request).await?;
        Ok(encode_payload(&response)?)
    })
}

pub static ECHO_SERVICE_DESC: ServiceDesc<dyn EchoServer> = ServiceDesc {
    service_name: "wsrpc.Echo",
    methods: &[MethodDesc {
        method_name: "Echo",
        handler: echo_echo_handler,
    }],
};

/// Answers with the request body after the requested delay.
#[derive(Debug, Default)]
pub struct EchoService;

#[async_trait]
impl EchoServer for EchoService {
    async fn echo(&self, _ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, HandlerError> {
        if request.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
        }
        Ok(EchoResponse { body: request.body })
    }
}
