//! The seam between the substrate and a concrete AMQP client.
//!
//! Everything above this module (connection manager, publisher, RPC client,
//! consumers) only talks to these traits. `crate::amqp` implements them on
//! top of lapin; `crate::memory_broker` implements them in-process.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{error::BusResult, routing::ExchangeKind};

/// Message properties the substrate cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(crate::routing::CONTENT_TYPE_JSON.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub auto_delete: bool,
    pub durable: bool,
}

impl QueueOptions {
    /// Direct one-way queue: shared, transient, removed with its last consumer.
    pub const fn shared() -> Self {
        Self { exclusive: false, auto_delete: true, durable: false }
    }

    /// RPC server queue: only one connection may hold it.
    pub const fn exclusive() -> Self {
        Self { exclusive: true, auto_delete: true, durable: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker considers messages settled on delivery.
    pub no_ack: bool,
    pub exclusive: bool,
}

/// A published message as requested by the caller.
#[derive(Debug, Clone)]
pub struct Publish<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub payload: &'a [u8],
    pub properties: MessageProperties,
    pub mandatory: bool,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
    async fn nack(&self, requeue: bool) -> BusResult<()>;
}

/// A message received from a queue.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self { body, properties, redelivered, acker }
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Factory for connections; one per process in practice.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> BusResult<Arc<dyn BrokerConnection>>;

    /// Human readable target, used in logs.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// False once the link is known to be lost.
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Turn on publisher confirms for this channel.
    async fn enable_confirms(&self) -> BusResult<()>;

    /// Durable, auto-deleting exchange of the given kind. Idempotent.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()>;

    /// Declares a queue and returns its actual name; an empty `name` asks the
    /// broker for an anonymous one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()>;

    /// Publishes and, when confirms are on, waits for the broker's verdict.
    async fn publish(&self, message: Publish<'_>) -> BusResult<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream>;

    async fn close(&self);
}
