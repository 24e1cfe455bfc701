//! Long-lived consume loops for the three queue topologies.
//!
//! A [`Consumer`] keeps its subscription alive until cancelled: when the
//! stream ends or a broker call fails it waits `retry_delay` and rebuilds
//! channel, queue, binding and consumer from scratch.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde_json::json;
use tokio::{task::JoinError, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::{BrokerChannel, ConsumeOptions, Delivery, MessageProperties, Publish, QueueOptions},
    connection::ConnectionManager,
    error::BusResult,
    handler::{SharedMessageHandler, SharedRpcHandler},
    metrics::{metrics, queue_attr},
    routing::{DEFAULT_EXCHANGE, ExchangeKind},
};

/// When a delivery is settled relative to its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack once the handler succeeded, nack with requeue when it fails or
    /// panics (at-least-once).
    #[default]
    AfterHandler,
    /// Ack on receipt; handler failures are only logged (at-most-once).
    OnReceipt,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub retry_delay: Duration,
    pub ack_policy: AckPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            ack_policy: AckPolicy::default(),
        }
    }
}

/// What a consumer listens to and who handles it.
#[derive(Clone)]
pub enum Subscription {
    /// Shared queue named `queue` on the direct exchange.
    Direct {
        queue: String,
        routing_key: String,
        handler: SharedMessageHandler,
    },
    /// Exclusive queue on the direct exchange; replies go to `reply_to`.
    Rpc {
        queue: String,
        routing_key: String,
        handler: SharedRpcHandler,
    },
    /// Anonymous queue on the topic exchange; every subscriber gets a copy.
    Topic {
        routing_key: String,
        handler: SharedMessageHandler,
    },
}

impl Subscription {
    pub fn routing_key(&self) -> &str {
        match self {
            Subscription::Direct { routing_key, .. }
            | Subscription::Rpc { routing_key, .. }
            | Subscription::Topic { routing_key, .. } => routing_key,
        }
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        match self {
            Subscription::Topic { .. } => ExchangeKind::Topic,
            _ => ExchangeKind::Direct,
        }
    }

    /// Metric label. Topic queues are server-named afresh on every
    /// session, so they are counted under their binding key.
    fn metric_key(&self) -> &str {
        match self {
            Subscription::Direct { queue, .. } | Subscription::Rpc { queue, .. } => queue,
            Subscription::Topic { routing_key, .. } => routing_key,
        }
    }

    fn label(&self) -> String {
        match self {
            Subscription::Direct { queue, .. } => format!("direct queue `{queue}`"),
            Subscription::Rpc { queue, .. } => format!("rpc queue `{queue}`"),
            Subscription::Topic { routing_key, .. } => format!("topic `{routing_key}`"),
        }
    }
}

pub struct Consumer {
    connections: Arc<ConnectionManager>,
    subscription: Subscription,
    options: ConsumerOptions,
}

impl Consumer {
    pub fn new(connections: Arc<ConnectionManager>, subscription: Subscription, options: ConsumerOptions) -> Self {
        Self { connections, subscription, options }
    }

    /// Runs until `cancel` fires. Never returns early on broker trouble.
    pub async fn run(self, cancel: CancellationToken) {
        let label = self.subscription.label();
        info!("▶️ consumer for {label} starting");
        loop {
            match self.session(&cancel).await {
                _ if cancel.is_cancelled() => break,
                Ok(()) => warn!("🔌 consumer for {label} lost its stream, rebuilding"),
                Err(err) if err.is_resource_locked() => {
                    metrics().resource_conflicts.add(1, &queue_attr(self.subscription.metric_key()));
                    warn!(
                        "⚠️ {label} is held by another consumer, retrying in {:?}",
                        self.options.retry_delay
                    );
                }
                Err(err) => error!(
                    "❌ consumer for {label} failed: {err}; retrying in {:?}",
                    self.options.retry_delay
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.options.retry_delay) => {}
            }
        }
        info!("🛑 consumer for {label} stopped");
    }

    async fn session(&self, cancel: &CancellationToken) -> BusResult<()> {
        let Some(connection) = self.connections.get_connection_until(cancel).await else {
            return Ok(());
        };
        let channel = connection.open_channel().await?;
        let result = self.consume_on(channel.as_ref(), cancel).await;
        channel.close().await;
        result
    }

    async fn consume_on(&self, channel: &dyn BrokerChannel, cancel: &CancellationToken) -> BusResult<()> {
        let kind = self.subscription.exchange_kind();
        let exchange = kind.exchange_name();
        channel.declare_exchange(exchange, kind).await?;

        let (queue, consume) = match &self.subscription {
            Subscription::Direct { queue, .. } => (
                channel.declare_queue(queue, QueueOptions::shared()).await?,
                ConsumeOptions::default(),
            ),
            Subscription::Rpc { queue, .. } => (
                channel.declare_queue(queue, QueueOptions::exclusive()).await?,
                ConsumeOptions { no_ack: false, exclusive: true },
            ),
            Subscription::Topic { .. } => (
                channel
                    .declare_queue("", QueueOptions { exclusive: false, auto_delete: true, durable: false })
                    .await?,
                ConsumeOptions::default(),
            ),
        };
        channel.bind_queue(&queue, exchange, self.subscription.routing_key()).await?;
        let mut stream = channel.consume(&queue, consume).await?;
        debug!("consuming {queue} bound to {exchange}/{}", self.subscription.routing_key());

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => match next {
                    Some(delivery) => delivery?,
                    None => return Ok(()),
                },
            };
            metrics().deliveries.add(1, &queue_attr(self.subscription.metric_key()));
            match &self.subscription {
                Subscription::Direct { handler, .. } | Subscription::Topic { handler, .. } => {
                    self.deliver(&queue, delivery, handler.clone()).await?
                }
                Subscription::Rpc { handler, .. } => {
                    self.answer(channel, &queue, delivery, handler.clone()).await?
                }
            }
        }
    }

    /// One-way delivery: settle according to the ack policy.
    async fn deliver(&self, queue: &str, delivery: Delivery, handler: SharedMessageHandler) -> BusResult<()> {
        let early = self.options.ack_policy == AckPolicy::OnReceipt;
        if early {
            delivery.ack().await?;
        }

        let body = delivery.body.clone();
        let outcome = tokio::spawn(async move { handler.handle(body).await }).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(join) => Some(panic_message(join)),
        };

        match failure {
            None if !early => delivery.ack().await,
            None => Ok(()),
            Some(reason) => {
                metrics().handler_failures.add(1, &queue_attr(self.subscription.metric_key()));
                if early {
                    error!("❌ handler for `{queue}` failed (message already acked): {reason}");
                    Ok(())
                } else {
                    error!("❌ handler for `{queue}` failed, requeueing: {reason}");
                    delivery.nack(true).await
                }
            }
        }
    }

    /// Request/reply delivery: the reply (or an error-shaped one) goes to
    /// `reply_to` through the default exchange, then the request is acked.
    async fn answer(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        delivery: Delivery,
        handler: SharedRpcHandler,
    ) -> BusResult<()> {
        let Some(reply_to) = delivery.properties.reply_to.clone() else {
            warn!("dropping request on `{queue}` without reply_to");
            return delivery.ack().await;
        };

        let early = self.options.ack_policy == AckPolicy::OnReceipt;
        if early {
            delivery.ack().await?;
        }

        let body = delivery.body.clone();
        let outcome = tokio::spawn(async move { handler.handle(body).await }).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                metrics().handler_failures.add(1, &queue_attr(self.subscription.metric_key()));
                error!("❌ rpc handler for `{queue}` failed: {err:#}");
                error_reply(&format!("{err:#}"))
            }
            Err(join) => {
                metrics().handler_failures.add(1, &queue_attr(self.subscription.metric_key()));
                let reason = panic_message(join);
                error!("❌ rpc handler for `{queue}` panicked: {reason}");
                error_reply(&reason)
            }
        };

        let mut properties = MessageProperties::json();
        properties.correlation_id = delivery.properties.correlation_id.clone();
        let published = channel
            .publish(Publish {
                exchange: DEFAULT_EXCHANGE,
                routing_key: &reply_to,
                payload: &reply,
                properties,
                mandatory: false,
            })
            .await;

        match published {
            Ok(()) if early => Ok(()),
            Ok(()) => delivery.ack().await,
            Err(err) => {
                error!("❌ reply to `{reply_to}` from `{queue}` failed: {err}");
                if !early {
                    let _ = delivery.nack(true).await;
                }
                Err(err)
            }
        }
    }
}

/// `{"status":"error","error":"<reason>"}`
pub fn error_reply(reason: &str) -> Vec<u8> {
    json!({ "status": "error", "error": reason }).to_string().into_bytes()
}

fn panic_message(join: JoinError) -> String {
    let Ok(payload) = join.try_into_panic() else {
        return "handler task was cancelled".to_string();
    };
    match payload.downcast::<String>() {
        Ok(message) => format!("panic: {message}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => format!("panic: {message}"),
            Err(_) => "panic".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_metrics_use_the_binding_key() {
        let handler: SharedMessageHandler = Arc::new(|_body: Vec<u8>| async { Ok::<_, anyhow::Error>(()) });
        let topic = Subscription::Topic { routing_key: "emit_log.*".into(), handler: handler.clone() };
        assert_eq!(topic.metric_key(), "emit_log.*");

        let direct = Subscription::Direct {
            queue: "apollo_pt_sync".into(),
            routing_key: "apollo_pt_sync".into(),
            handler,
        };
        assert_eq!(direct.metric_key(), "apollo_pt_sync");
    }

    #[test]
    fn error_reply_shape() {
        let reply: serde_json::Value = serde_json::from_slice(&error_reply("boom \"quoted\"")).unwrap();
        assert_eq!(reply, json!({"status": "error", "error": "boom \"quoted\""}));
    }

    #[tokio::test]
    async fn panic_payloads_are_readable() {
        let join = tokio::spawn(async { panic!("bad input {}", 7) }).await.unwrap_err();
        assert_eq!(panic_message(join), "panic: bad input 7");

        let join = tokio::spawn(async { panic!("static") }).await.unwrap_err();
        assert_eq!(panic_message(join), "panic: static");
    }
}
