use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    amqp::AmqpBroker,
    broker::Broker,
    connection::ConnectionManager,
    error::BusResult,
    publisher::Publisher,
    reply_resolver::ReplyResolver,
    rpc_client::{CallOptions, RpcClient},
    settings::{BusTimings, RabbitmqSettings},
};

/// Everything a container needs to talk to the orchestrator: the shared
/// connection, one-way sends, and RPC calls.
///
/// Must be created inside a tokio runtime (the reply resolver is spawned
/// right away). Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct ContainerBus {
    connections: Arc<ConnectionManager>,
    publisher: Publisher,
    rpc: RpcClient,
    resolver: ReplyResolver,
    timings: BusTimings,
    shutdown: CancellationToken,
}

impl ContainerBus {
    pub fn new(broker: Arc<dyn Broker>, timings: BusTimings) -> Self {
        let shutdown = CancellationToken::new();
        let connections = Arc::new(ConnectionManager::new(broker, timings.connect_retry_delay));
        let resolver = ReplyResolver::spawn(connections.clone(), shutdown.child_token());
        Self {
            publisher: Publisher::new(connections.clone(), timings.confirm_timeout),
            rpc: RpcClient::new(resolver.clone(), &timings),
            connections,
            resolver,
            timings,
            shutdown,
        }
    }

    /// Bus backed by RabbitMQ.
    pub fn amqp(settings: RabbitmqSettings, timings: BusTimings) -> Self {
        Self::new(Arc::new(AmqpBroker::new(settings)), timings)
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn timings(&self) -> &BusTimings {
        &self.timings
    }

    /// Calls still waiting on a reply.
    pub async fn pending_calls(&self) -> usize {
        self.resolver.pending_count().await
    }

    pub async fn send(&self, routing_key: &str, payload: &[u8]) {
        self.publisher.send(routing_key, payload).await
    }

    pub async fn try_send(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        self.publisher.try_send(routing_key, payload).await
    }

    pub async fn broadcast(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        self.publisher.broadcast(routing_key, payload).await
    }

    pub async fn call(&self, routing_key: &str, payload: &[u8]) -> BusResult<Vec<u8>> {
        self.rpc.call(routing_key, payload).await
    }

    pub async fn call_with(&self, routing_key: &str, payload: &[u8], options: CallOptions) -> BusResult<Vec<u8>> {
        self.rpc.call_with(routing_key, payload, options).await
    }

    pub async fn call_json<Req, Resp>(&self, routing_key: &str, request: &Req) -> BusResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.rpc.call_json(routing_key, request).await
    }

    /// Stops the reply resolver. Calls in flight and any later call return
    /// [`BusError::Shutdown`](crate::BusError::Shutdown). Consumers have
    /// their own token, see [`crate::registry::RunningConsumers`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
