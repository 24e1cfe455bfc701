use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{debug, error};

use crate::{
    broker::{MessageProperties, Publish},
    connection::ConnectionManager,
    error::{BusError, BusResult},
    metrics::{metrics, queue_attr},
    routing::ExchangeKind,
};

/// One-way sends with publisher confirms.
///
/// Every message goes out on a channel of its own which is closed again
/// afterwards, whatever the outcome.
#[derive(Clone)]
pub struct Publisher {
    connections: Arc<ConnectionManager>,
    confirm_timeout: Duration,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionManager>, confirm_timeout: Duration) -> Self {
        Self { connections, confirm_timeout }
    }

    /// Best-effort send through the direct exchange. Failures are logged and
    /// the message is abandoned.
    pub async fn send(&self, routing_key: &str, payload: &[u8]) {
        if let Err(err) = self.try_send(routing_key, payload).await {
            error!("❌ send to `{routing_key}` abandoned: {err}");
        }
    }

    /// Like [`send`](Self::send) but hands the failure back.
    pub async fn try_send(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        self.publish(ExchangeKind::Direct, routing_key, payload).await
    }

    /// Publishes to the topic exchange; every bound subscriber gets a copy.
    pub async fn broadcast(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        self.publish(ExchangeKind::Topic, routing_key, payload).await
    }

    async fn publish(&self, kind: ExchangeKind, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        let result = self.publish_once(kind, routing_key, payload).await;
        match &result {
            Ok(()) => {
                metrics().published.add(1, &queue_attr(routing_key));
                debug!("📤 {} bytes to {}/{routing_key}", payload.len(), kind.exchange_name());
            }
            Err(_) => metrics().publish_failures.add(1, &queue_attr(routing_key)),
        }
        result
    }

    async fn publish_once(&self, kind: ExchangeKind, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        let connection = self.connections.get_connection().await;
        let channel = connection.open_channel().await?;

        let outcome = async {
            channel.enable_confirms().await?;
            channel.declare_exchange(kind.exchange_name(), kind).await?;
            let message = Publish {
                exchange: kind.exchange_name(),
                routing_key,
                payload,
                properties: MessageProperties::json(),
                mandatory: true,
            };
            timeout(self.confirm_timeout, channel.publish(message))
                .await
                .map_err(|_| BusError::Timeout("publisher confirm", self.confirm_timeout))?
        }
        .await;

        channel.close().await;
        outcome
    }
}
