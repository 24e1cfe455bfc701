//! In-process broker with the AMQP behaviours the substrate relies on.
//!
//! Supports direct, topic and the default exchange, exclusive and
//! auto-deleting queues, manual acknowledgement with requeue, mandatory
//! returns and direct-reply-to. Outages are simulated with
//! [`MemoryBroker::sever_connections`] and [`MemoryBroker::set_online`].
//! Used by the test suite and for running containers locally without
//! RabbitMQ.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery,
        DeliveryStream, MessageProperties, Publish, QueueOptions,
    },
    error::{BusError, BusResult},
    routing::{DEFAULT_EXCHANGE, DIRECT_REPLY_TO, ExchangeKind, topic_matches},
};

type DeliverySender = UnboundedSender<BusResult<Delivery>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    next_id: AtomicU64,
    connect_attempts: AtomicU64,
    locked_refusals: Mutex<HashMap<String, u64>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: Mutex::new(State { online: true, ..Default::default() }),
            next_id: AtomicU64::new(1),
            connect_attempts: AtomicU64::new(0),
            locked_refusals: Mutex::default(),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn resource_locked(&self, queue: &str) -> BusError {
        *self
            .locked_refusals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(queue.to_owned())
            .or_default() += 1;
        BusError::ResourceLocked { queue: queue.to_owned() }
    }
}

#[derive(Default)]
struct State {
    online: bool,
    connections: HashMap<u64, Arc<AtomicBool>>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    reply_routes: HashMap<String, ReplyRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct Queue {
    /// Connection holding an exclusive queue.
    owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    connection: u64,
    channel: u64,
    no_ack: bool,
    exclusive: bool,
    tx: DeliverySender,
}

struct Unacked {
    message: Stored,
    connection: u64,
    channel: u64,
}

struct ReplyRoute {
    connection: u64,
    channel: u64,
    tx: DeliverySender,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every connection attempt fails.
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    /// Drops every live connection as if the TCP link died: consumer streams
    /// end, unacknowledged messages are requeued, exclusive queues and reply
    /// routes of those connections disappear.
    pub fn sever_connections(&self) {
        let mut state = self.inner.lock();
        let dead: Vec<u64> = state.connections.keys().copied().collect();
        for id in &dead {
            if let Some(alive) = state.connections.remove(id) {
                alive.store(false, Ordering::SeqCst);
            }
        }
        debug!("memory broker severed {} connection(s)", dead.len());
        state.release(&self.inner, |connection, _| dead.contains(&connection));
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    /// How often a declare or consume on `queue` was refused as
    /// RESOURCE_LOCKED.
    pub fn locked_refusals(&self, queue: &str) -> u64 {
        self.inner
            .locked_refusals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Queues bound to `exchange` with exactly this binding key.
    pub fn bound_queues(&self, exchange: &str, binding_key: &str) -> usize {
        self.inner
            .lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == binding_key)
            .count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BusResult<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();
        if !state.online {
            return Err(BusError::ConnectionClosed);
        }
        let id = self.inner.next_id();
        let alive = Arc::new(AtomicBool::new(true));
        state.connections.insert(id, alive.clone());
        Ok(Arc::new(MemoryConnection { inner: self.inner.clone(), id, alive }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(BusError::ConnectionClosed);
        }
        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            connection: self.id,
            alive: self.alive.clone(),
            id: self.inner.next_id(),
            reply_address: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    connection: u64,
    alive: Arc<AtomicBool>,
    id: u64,
    reply_address: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn check_open(&self) -> BusResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionClosed);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::ChannelClosed);
        }
        Ok(())
    }

    fn reply_address(&self) -> Option<String> {
        self.reply_address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self.id;
        self.inner.lock().release(&self.inner, |_, ch| ch == channel);
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn enable_confirms(&self) -> BusResult<()> {
        self.check_open()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BusResult<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BusError::Protocol(format!(
                "PRECONDITION_FAILED - exchange `{name}` exists as {existing}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> BusResult<String> {
        self.check_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };
        let mut state = self.inner.lock();
        if let Some(queue) = state.queues.get(&name) {
            return match queue.owner {
                Some(owner) if owner != self.connection => Err(self.inner.resource_locked(&name)),
                _ => Ok(name),
            };
        }
        state.queues.insert(
            name.clone(),
            Queue {
                owner: options.exclusive.then_some(self.connection),
                auto_delete: options.auto_delete,
                ..Default::default()
            },
        );
        trace!("memory broker declared queue {name}");
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BusResult<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Protocol(format!("NOT_FOUND - no exchange `{exchange}`")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Protocol(format!("NOT_FOUND - no queue `{queue}`")));
        }
        let binding = Binding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            queue: queue.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, message: Publish<'_>) -> BusResult<()> {
        self.check_open()?;
        let mut properties = message.properties;
        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_TO) {
            match self.reply_address() {
                Some(address) => properties.reply_to = Some(address),
                None => {
                    return Err(BusError::Protocol(
                        "PRECONDITION_FAILED - fast reply consumer does not exist".to_string(),
                    ));
                }
            }
        }
        let stored = Stored {
            body: message.payload.to_vec(),
            properties,
            redelivered: false,
        };

        let mut state = self.inner.lock();
        let routed = state.route(&self.inner, message.exchange, message.routing_key, stored)?;
        if !routed && message.mandatory {
            return Err(BusError::Unroutable {
                exchange: message.exchange.to_owned(),
                routing_key: message.routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> BusResult<DeliveryStream> {
        self.check_open()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<BusResult<Delivery>>();
        {
            let mut state = self.inner.lock();
            if queue == DIRECT_REPLY_TO {
                if !options.no_ack {
                    return Err(BusError::Protocol(
                        "PRECONDITION_FAILED - reply consumer must use no_ack".to_string(),
                    ));
                }
                let address = format!("{DIRECT_REPLY_TO}.{}.{}", self.id, Uuid::new_v4().simple());
                state.reply_routes.insert(
                    address.clone(),
                    ReplyRoute { connection: self.connection, channel: self.id, tx },
                );
                *self.reply_address.lock().unwrap_or_else(|p| p.into_inner()) = Some(address);
            } else {
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| BusError::Protocol(format!("NOT_FOUND - no queue `{queue}`")))?;
                if let Some(owner) = q.owner {
                    if owner != self.connection {
                        return Err(self.inner.resource_locked(queue));
                    }
                }
                if q.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !q.consumers.is_empty()) {
                    return Err(self.inner.resource_locked(queue));
                }
                q.had_consumer = true;
                q.consumers.push(ConsumerSlot {
                    connection: self.connection,
                    channel: self.id,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    tx,
                });
                state.pump(&self.inner, queue);
            }
        }
        Ok(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl State {
    /// Routes one message; returns whether any queue (or reply consumer)
    /// received it.
    fn route(&mut self, inner: &Arc<Inner>, exchange: &str, routing_key: &str, message: Stored) -> BusResult<bool> {
        if exchange == DEFAULT_EXCHANGE {
            if let Some(route) = self.reply_routes.get(routing_key) {
                let delivery = Delivery::new(
                    message.body,
                    message.properties,
                    false,
                    Box::new(SettledAcker),
                );
                return Ok(route.tx.send(Ok(delivery)).is_ok());
            }
            if self.queues.contains_key(routing_key) {
                self.enqueue(inner, routing_key, message);
                return Ok(true);
            }
            return Ok(false);
        }

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::Protocol(format!("NOT_FOUND - no exchange `{exchange}`")))?;
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        for queue in &targets {
            self.enqueue(inner, queue, message.clone());
        }
        Ok(!targets.is_empty())
    }

    fn enqueue(&mut self, inner: &Arc<Inner>, queue: &str, message: Stored) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
        self.pump(inner, queue);
    }

    /// Hands ready messages to consumers, round-robin.
    fn pump(&mut self, inner: &Arc<Inner>, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = index + 1;
            let (no_ack, connection, channel) = {
                let c = &queue.consumers[index];
                (c.no_ack, c.connection, c.channel)
            };
            let tag = inner.next_id();
            let acker: Box<dyn Acknowledger> = if no_ack {
                Box::new(SettledAcker)
            } else {
                Box::new(MemoryAcker {
                    inner: Arc::downgrade(inner),
                    queue: queue_name.to_owned(),
                    tag,
                })
            };
            let delivery = Delivery::new(
                message.body.clone(),
                message.properties.clone(),
                message.redelivered,
                acker,
            );
            if queue.consumers[index].tx.send(Ok(delivery)).is_err() {
                // receiver went away without closing its channel
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }
            if !no_ack {
                queue.unacked.insert(tag, Unacked { message, connection, channel });
            }
        }
    }

    /// Removes consumers, reply routes and unacked deliveries matching
    /// `owned_by(connection, channel)`, requeues what was in flight and
    /// deletes queues that lost their owner or last consumer.
    fn release(&mut self, inner: &Arc<Inner>, owned_by: impl Fn(u64, u64) -> bool) {
        self.reply_routes.retain(|_, r| !owned_by(r.connection, r.channel));

        let mut touched = Vec::new();
        let mut doomed = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !owned_by(c.connection, c.channel));
            let lost: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| owned_by(u.connection, u.channel))
                .map(|(tag, _)| *tag)
                .collect();
            let mut requeued: Vec<Stored> = lost
                .iter()
                .filter_map(|tag| queue.unacked.remove(tag))
                .map(|u| Stored { redelivered: true, ..u.message })
                .collect();
            requeued.reverse();
            for message in requeued {
                queue.ready.push_front(message);
            }

            let owner_gone = queue
                .owner
                .is_some_and(|owner| !self.connections.contains_key(&owner));
            let abandoned = queue.auto_delete && queue.had_consumer && queue.consumers.is_empty();
            if owner_gone || (abandoned && before > 0) {
                doomed.push(name.clone());
            } else if before != queue.consumers.len() || !lost.is_empty() {
                touched.push(name.clone());
            }
        }
        for name in &doomed {
            trace!("memory broker deleted queue {name}");
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !doomed.contains(&b.queue));
        for name in touched {
            self.pump(inner, &name);
        }
    }
}

/// Acknowledger for messages that need no settlement (no_ack, replies).
struct SettledAcker;

#[async_trait]
impl Acknowledger for SettledAcker {
    async fn ack(&self) -> BusResult<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> BusResult<()> {
        Ok(())
    }
}

struct MemoryAcker {
    inner: Weak<Inner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> BusResult<()> {
        let inner = self.inner.upgrade().ok_or(BusError::ConnectionClosed)?;
        let mut state = inner.lock();
        let unacked = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or(BusError::ChannelClosed)?;
        if requeue == Some(true) {
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(Stored { redelivered: true, ..unacked.message });
            }
            state.pump(&inner, &self.queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        self.settle(Some(requeue))
    }
}
