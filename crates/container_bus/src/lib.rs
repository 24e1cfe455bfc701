//! Messaging substrate for orchestrator plugin containers.
//!
//! A container talks to the orchestrator over an AMQP broker: one-way sends
//! through the direct exchange, request/reply calls correlated over the
//! broker's direct reply-to queue, and broadcasts on the topic exchange.
//! [`ContainerBus`] is the client side; a [`DispatchRegistry`] turns the
//! container's handlers into supervised consume loops.

pub mod amqp;
pub mod broker;
pub mod bus;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod memory_broker;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod reply_resolver;
pub mod routing;
pub mod rpc_client;
pub mod settings;

pub use amqp::AmqpBroker;
pub use bus::ContainerBus;
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{AckPolicy, error_reply};
pub use error::{BusError, BusResult};
pub use handler::{MessageHandler, RpcHandler, json_rpc};
pub use memory_broker::MemoryBroker;
pub use registry::{DispatchRegistry, RunningConsumers};
pub use rpc_client::CallOptions;
pub use settings::{BusTimings, RabbitmqSettings};
