//! The seam generated client stubs call through.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_payload, encode_payload};
use crate::context::CallContext;
use crate::error::RpcError;

/// Something that can send a request and wait for its reply.
///
/// Implemented by [`Client`](crate::Client), [`Server`](crate::Server)
/// (calls go to the client named by `ctx.peer()`) and
/// [`Connection`](crate::Connection).
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError>;
}

#[async_trait]
impl<T: Invoker + ?Sized> Invoker for Arc<T> {
    async fn invoke_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        (**self).invoke_raw(ctx, method, payload).await
    }
}

/// Typed call: MessagePack-encode `request`, invoke, decode the reply.
pub async fn invoke<I, Req, Resp>(
    invoker: &I,
    ctx: &CallContext,
    method: &str,
    request: &Req,
) -> Result<Resp, RpcError>
where
    I: Invoker + ?Sized,
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let payload = encode_payload(request)?;
    let reply = invoker.invoke_raw(ctx, method, payload).await?;
    decode_payload(&reply)
}
