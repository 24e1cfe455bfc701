//! lapin-backed implementation of the broker seam.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
};
use tracing::debug;

use crate::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery,
        DeliveryStream, MessageProperties, Publish, QueueOptions,
    },
    error::{BusError, BusResult},
    routing::ExchangeKind,
    settings::RabbitmqSettings,
};

/// Connects to a real RabbitMQ broker.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    settings: RabbitmqSettings,
}

impl AmqpBroker {
    pub fn new(settings: RabbitmqSettings) -> Self {
        Self { settings }
    }

    /// Connection I/O and lapin's internal tasks run on the current tokio
    /// runtime.
    fn connection_properties(&self) -> ConnectionProperties {
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        if let Some(name) = &self.settings.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }
        properties
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> BusResult<Arc<dyn BrokerConnection>> {
        let uri = self.settings.amqp_uri()?;
        let connection = Connection::connect(&uri, self.connection_properties())
            .await
            .map_err(|e| map_lapin(e, None))?;
        debug!("AMQP connection established to {}", self.describe());
        Ok(Arc::new(AmqpConnection { connection }))
    }

    fn describe(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            self.settings.user, self.settings.host, self.settings.port, self.settings.vhost
        )
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| map_lapin(e, None))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn enable_confirms(&self) -> BusResult<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_lapin(e, None))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            auto_delete: true,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, kind, options, FieldTable::default())
            .await
            .map_err(|e| map_lapin(e, None))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<String> {
        let declare = QueueDeclareOptions {
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            durable: options.durable,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(|e| map_lapin(e, Some(name)))?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| map_lapin(e, Some(queue)))
    }

    async fn publish(&self, message: Publish<'_>) -> BusResult<()> {
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            ..Default::default()
        };
        let confirm = self
            .channel
            .basic_publish(
                message.exchange,
                message.routing_key,
                options,
                message.payload,
                to_basic_properties(message.properties),
            )
            .await
            .map_err(|e| map_lapin(e, None))?;

        match confirm.await.map_err(|e| map_lapin(e, None))? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            // a mandatory message came back through basic.return
            Confirmation::Ack(Some(_)) => Err(BusError::Unroutable {
                exchange: message.exchange.to_owned(),
                routing_key: message.routing_key.to_owned(),
            }),
            Confirmation::Nack(_) => Err(BusError::Nacked),
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream> {
        let consume = BasicConsumeOptions {
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            ..Default::default()
        };
        let consumer = self
            .channel
            .basic_consume(queue, "", consume, FieldTable::default())
            .await
            .map_err(|e| map_lapin(e, Some(queue)))?;

        let no_ack = options.no_ack;
        Ok(consumer
            .map(move |item| match item {
                Ok(delivery) => Ok(from_lapin(delivery, no_ack)),
                Err(e) => Err(map_lapin(e, None)),
            })
            .boxed())
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "OK").await {
            debug!("closing channel failed: {e}");
        }
    }
}

struct LapinAcker {
    acker: Acker,
    no_ack: bool,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> BusResult<()> {
        if self.no_ack {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| map_lapin(e, None))
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        if self.no_ack {
            return Ok(());
        }
        self.acker
            .nack(BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(|e| map_lapin(e, None))
    }
}

fn from_lapin(delivery: LapinDelivery, no_ack: bool) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_owned()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_owned()),
    };
    Delivery::new(
        delivery.data,
        properties,
        delivery.redelivered,
        Box::new(LapinAcker { acker: delivery.acker, no_ack }),
    )
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to));
    }
    basic
}

fn map_lapin(error: lapin::Error, queue: Option<&str>) -> BusError {
    match &error {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => BusError::ResourceLocked {
                queue: queue.unwrap_or_default().to_owned(),
            },
            _ => BusError::Protocol(error.to_string()),
        },
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => BusError::ConnectionClosed,
        lapin::Error::InvalidChannelState(_) => BusError::ChannelClosed,
        _ => BusError::Protocol(error.to_string()),
    }
}
