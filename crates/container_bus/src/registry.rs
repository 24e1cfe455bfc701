use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bus::ContainerBus,
    consumer::{AckPolicy, Consumer, ConsumerOptions, Subscription},
    handler::{MessageHandler, RpcHandler},
    routing::queue_name,
};

/// The handlers a container serves, keyed by message kind.
///
/// Built once at startup, then handed to [`start`](Self::start) which
/// spawns one consume loop per entry. Registering the same queue twice
/// replaces the earlier handler.
pub struct DispatchRegistry {
    container_name: String,
    subscriptions: Vec<Subscription>,
    ack_policy: AckPolicy,
}

impl DispatchRegistry {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            subscriptions: Vec::new(),
            ack_policy: AckPolicy::default(),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    /// One-way handler on `<container>_<kind>`.
    pub fn direct(mut self, kind: &str, handler: impl MessageHandler) -> Self {
        let queue = queue_name(&self.container_name, kind);
        self.insert(Subscription::Direct {
            routing_key: queue.clone(),
            queue,
            handler: Arc::new(handler),
        });
        self
    }

    /// Request/reply handler on the exclusive queue `<container>_<kind>`.
    pub fn rpc(mut self, kind: &str, handler: impl RpcHandler) -> Self {
        let queue = queue_name(&self.container_name, kind);
        self.insert(Subscription::Rpc {
            routing_key: queue.clone(),
            queue,
            handler: Arc::new(handler),
        });
        self
    }

    /// Broadcast handler; `routing_key` may use topic wildcards.
    pub fn topic(mut self, routing_key: &str, handler: impl MessageHandler) -> Self {
        self.insert(Subscription::Topic {
            routing_key: routing_key.to_owned(),
            handler: Arc::new(handler),
        });
        self
    }

    fn insert(&mut self, subscription: Subscription) {
        let key = subscription_key(&subscription);
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| subscription_key(s) == key) {
            warn!("handler for {key} registered twice, keeping the last one");
            *existing = subscription;
        } else {
            self.subscriptions.push(subscription);
        }
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Spawns every consume loop. They stop when `cancel` (or
    /// [`RunningConsumers::shutdown`]) fires.
    pub fn start(self, bus: &ContainerBus, cancel: &CancellationToken) -> RunningConsumers {
        let cancel = cancel.child_token();
        let options = ConsumerOptions {
            retry_delay: bus.timings().consumer_retry_delay,
            ack_policy: self.ack_policy,
        };
        info!(
            "📋 starting {} consumer(s) for container `{}`",
            self.subscriptions.len(),
            self.container_name
        );
        let handles = self
            .subscriptions
            .into_iter()
            .map(|subscription| {
                let consumer = Consumer::new(bus.connections().clone(), subscription, options);
                tokio::spawn(consumer.run(cancel.clone()))
            })
            .collect();
        RunningConsumers { cancel, handles }
    }
}

fn subscription_key(subscription: &Subscription) -> String {
    match subscription {
        Subscription::Direct { queue, .. } | Subscription::Rpc { queue, .. } => format!("queue `{queue}`"),
        Subscription::Topic { routing_key, .. } => format!("topic `{routing_key}`"),
    }
}

/// Consume loops started from a [`DispatchRegistry`].
pub struct RunningConsumers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunningConsumers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the loops to end (they only do once cancelled).
    pub async fn wait(self) {
        for result in join_all(self.handles).await {
            if let Err(err) = result {
                warn!("consumer task ended abnormally: {err}");
            }
        }
    }

    /// Cancels every loop and waits for them to finish their current
    /// delivery.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }
}
