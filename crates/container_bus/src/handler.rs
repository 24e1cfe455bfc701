//! Handler boundary: raw bytes in, nothing or raw bytes out.
//!
//! Plain async closures implement both traits, so most containers never
//! name them:
//!
//! ```ignore
//! registry.rpc("echo", |body: Vec<u8>| async move { Ok(body) });
//! ```

use std::{future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// One-way handler for direct and topic deliveries. An `Err` (or a panic)
/// sends the message back to the queue, so handlers must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<()>;
}

/// Request/reply handler. An `Err` becomes an error-shaped reply.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

pub type SharedMessageHandler = Arc<dyn MessageHandler>;
pub type SharedRpcHandler = Arc<dyn RpcHandler>;

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<()> {
        (self)(body).await
    }
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        (self)(body).await
    }
}

/// Adapts a typed `Req -> Resp` function into an [`RpcHandler`]. A request
/// that does not deserialize is a handler error.
pub struct JsonRpc<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

pub fn json_rpc<F, Fut, Req, Resp>(f: F) -> JsonRpc<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    JsonRpc { f, _types: PhantomData }
}

#[async_trait]
impl<F, Fut, Req, Resp> RpcHandler for JsonRpc<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let request: Req = serde_json::from_slice(&body)?;
        let response = (self.f)(request).await?;
        Ok(serde_json::to_vec(&response)?)
    }
}
