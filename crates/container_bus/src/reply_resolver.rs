//! Single consumer of the direct-reply-to pseudo-queue.
//!
//! The resolver is an actor: one task owns the pending-call table and the
//! reply channel, everything else talks to it through [`Command`]s. A call
//! registers its correlation id, publishes on the channel handed out here
//! (direct reply-to only works on the channel that consumes it) and waits on
//! a oneshot. Entries leave the table when the reply arrives, when the caller
//! drops its [`PendingReply`] (timeout, cancellation, publish failure) or
//! when the reply stream is lost.

use std::{collections::HashMap, sync::Arc};

use futures_util::StreamExt;
use serde::de::IgnoredAny;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    broker::{BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream},
    connection::ConnectionManager,
    error::{BusError, BusResult},
    metrics::metrics,
    routing::{DIRECT_EXCHANGE, DIRECT_REPLY_TO, ExchangeKind},
};

enum Command {
    Register {
        correlation_id: String,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Forget {
        correlation_id: String,
    },
    Channel(oneshot::Sender<BusResult<Arc<dyn BrokerChannel>>>),
    PendingCount(oneshot::Sender<usize>),
}

/// Handle to the resolver task. Cheap to clone.
#[derive(Clone)]
pub struct ReplyResolver {
    cmd_tx: UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl ReplyResolver {
    /// Spawns the resolver task. It runs until `shutdown` fires or every
    /// handle is dropped.
    pub fn spawn(connections: Arc<ConnectionManager>, shutdown: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(resolver_loop(cmd_rx, connections, shutdown.clone()));
        Self { cmd_tx, shutdown }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled() || self.cmd_tx.is_closed()
    }

    /// Completes once the resolver has been told to stop.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.cmd_tx.closed() => {}
        }
    }

    fn gone(&self) -> BusError {
        if self.is_stopped() { BusError::Shutdown } else { BusError::ReplyLost }
    }

    /// The channel to publish requests on. Opens it (and attaches the reply
    /// consumer) on first use and after a loss.
    pub async fn reply_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        if self.is_stopped() {
            return Err(BusError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Channel(tx)).map_err(|_| BusError::Shutdown)?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Adds `correlation_id` to the pending table. Dropping the returned
    /// [`PendingReply`] removes it again.
    pub fn register(&self, correlation_id: &str) -> BusResult<PendingReply> {
        if self.is_stopped() {
            return Err(BusError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register { correlation_id: correlation_id.to_owned(), reply: tx })
            .map_err(|_| BusError::Shutdown)?;
        Ok(PendingReply {
            correlation_id: correlation_id.to_owned(),
            reply: rx,
            cmd_tx: self.cmd_tx.clone(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Number of calls currently waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// A registered call waiting for its reply.
pub struct PendingReply {
    correlation_id: String,
    reply: oneshot::Receiver<Vec<u8>>,
    cmd_tx: UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl PendingReply {
    /// Resolves with the reply body, `ReplyLost` when the reply stream went
    /// away first, or `Shutdown` when the resolver stopped.
    pub async fn wait(&mut self) -> BusResult<Vec<u8>> {
        match (&mut self.reply).await {
            Ok(body) => Ok(body),
            Err(_) if self.shutdown.is_cancelled() || self.cmd_tx.is_closed() => Err(BusError::Shutdown),
            Err(_) => Err(BusError::ReplyLost),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // no-op in the table if the reply already resolved it
        let _ = self.cmd_tx.send(Command::Forget {
            correlation_id: std::mem::take(&mut self.correlation_id),
        });
    }
}

struct ReplyLink {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    stream: DeliveryStream,
}

async fn resolver_loop(
    mut cmd_rx: UnboundedReceiver<Command>,
    connections: Arc<ConnectionManager>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<String, oneshot::Sender<Vec<u8>>> = HashMap::new();
    let mut link: Option<ReplyLink> = None;

    loop {
        // commands first: a registration always lands before its reply
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Register { correlation_id, reply } => {
                        pending.insert(correlation_id, reply);
                    }
                    Command::Forget { correlation_id } => {
                        if pending.remove(&correlation_id).is_some() {
                            trace!("forgot pending call {correlation_id}");
                        }
                    }
                    Command::Channel(respond) => {
                        if link.as_ref().is_some_and(|l| !l.connection.is_connected()) {
                            drop_link(&mut link, &mut pending, "connection lost").await;
                        }
                        if link.is_none() {
                            match open_link(&connections, &shutdown).await {
                                Ok(new_link) => link = Some(new_link),
                                Err(err) => {
                                    let _ = respond.send(Err(err));
                                    continue;
                                }
                            }
                        }
                        if let Some(l) = &link {
                            let _ = respond.send(Ok(l.channel.clone()));
                        }
                    }
                    Command::PendingCount(respond) => {
                        let _ = respond.send(pending.len());
                    }
                }
            }
            item = next_reply(&mut link) => match item {
                Some(Ok(delivery)) => resolve(&mut pending, delivery),
                Some(Err(err)) => {
                    drop_link(&mut link, &mut pending, &err.to_string()).await;
                }
                None => drop_link(&mut link, &mut pending, "stream ended").await,
            },
        }
    }

    if let Some(l) = link.take() {
        l.channel.close().await;
    }
    info!("🛑 reply resolver stopped ({} call(s) still pending)", pending.len());
}

async fn next_reply(link: &mut Option<ReplyLink>) -> Option<BusResult<Delivery>> {
    match link {
        Some(l) => l.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn open_link(connections: &ConnectionManager, shutdown: &CancellationToken) -> BusResult<ReplyLink> {
    let connection = connections
        .get_connection_until(shutdown)
        .await
        .ok_or(BusError::Shutdown)?;
    let channel = connection.open_channel().await?;
    let opened = async {
        channel.enable_confirms().await?;
        channel.declare_exchange(DIRECT_EXCHANGE, ExchangeKind::Direct).await?;
        channel
            .consume(DIRECT_REPLY_TO, ConsumeOptions { no_ack: true, exclusive: false })
            .await
    }
    .await;
    match opened {
        Ok(stream) => {
            debug!("reply consumer attached to {DIRECT_REPLY_TO}");
            Ok(ReplyLink { connection, channel, stream })
        }
        Err(err) => {
            channel.close().await;
            Err(err)
        }
    }
}

/// Tears the reply link down. Every pending call is woken with `ReplyLost`
/// so it can retry on a fresh channel straight away.
async fn drop_link(
    link: &mut Option<ReplyLink>,
    pending: &mut HashMap<String, oneshot::Sender<Vec<u8>>>,
    reason: &str,
) {
    if let Some(l) = link.take() {
        warn!("🔌 reply stream lost ({reason}), {} pending call(s) will retry", pending.len());
        l.channel.close().await;
    }
    pending.clear();
}

fn resolve(pending: &mut HashMap<String, oneshot::Sender<Vec<u8>>>, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
        warn!("dropping reply without correlation id");
        metrics().replies_dropped.add(1, &[]);
        return;
    };
    if !pending.contains_key(correlation_id) {
        warn!("dropping reply for unknown correlation id {correlation_id}");
        metrics().replies_dropped.add(1, &[]);
        return;
    }
    if let Err(err) = serde_json::from_slice::<IgnoredAny>(&delivery.body) {
        warn!("dropping undecodable reply for {correlation_id}: {err}");
        metrics().replies_dropped.add(1, &[]);
        return;
    }
    if let Some(reply) = pending.remove(correlation_id) {
        metrics().rpc_replies.add(1, &[]);
        if reply.send(delivery.body).is_err() {
            debug!("caller of {correlation_id} stopped waiting");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        broker::{Broker, MessageProperties, Publish},
        memory_broker::MemoryBroker,
        routing::DEFAULT_EXCHANGE,
    };

    fn resolver(broker: &MemoryBroker) -> ReplyResolver {
        resolver_with(broker, CancellationToken::new())
    }

    fn resolver_with(broker: &MemoryBroker, shutdown: CancellationToken) -> ReplyResolver {
        let manager = ConnectionManager::new(Arc::new(broker.clone()), Duration::from_millis(10));
        ReplyResolver::spawn(Arc::new(manager), shutdown)
    }

    /// Publishes `body` as a reply to whatever reply address `channel` owns,
    /// by bouncing a request through a scratch queue.
    async fn reply_address(broker: &MemoryBroker, channel: &Arc<dyn BrokerChannel>) -> String {
        let server = broker.connect().await.unwrap().open_channel().await.unwrap();
        server.declare_queue("scratch", Default::default()).await.unwrap();
        let mut requests = server.consume("scratch", ConsumeOptions { no_ack: true, exclusive: false }).await.unwrap();
        channel
            .publish(Publish {
                exchange: DEFAULT_EXCHANGE,
                routing_key: "scratch",
                payload: b"{}",
                properties: MessageProperties::json().with_reply_to(DIRECT_REPLY_TO),
                mandatory: true,
            })
            .await
            .unwrap();
        requests.next().await.unwrap().unwrap().properties.reply_to.unwrap()
    }

    async fn send_reply(broker: &MemoryBroker, to: &str, correlation_id: &str, body: &[u8]) {
        let channel = broker.connect().await.unwrap().open_channel().await.unwrap();
        channel
            .publish(Publish {
                exchange: DEFAULT_EXCHANGE,
                routing_key: to,
                payload: body,
                properties: MessageProperties::json().with_correlation_id(correlation_id),
                mandatory: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolves_matching_reply_and_ignores_others() {
        let broker = MemoryBroker::new();
        let resolver = resolver(&broker);
        let channel = resolver.reply_channel().await.unwrap();
        let address = reply_address(&broker, &channel).await;

        let mut call = resolver.register("abc").unwrap();
        send_reply(&broker, &address, "someone-else", br#"{"x":1}"#).await;
        send_reply(&broker, &address, "abc", b"not json").await;
        send_reply(&broker, &address, "abc", br#"{"ok":true}"#).await;

        let body = tokio::time::timeout(Duration::from_secs(1), call.wait()).await.unwrap().unwrap();
        assert_eq!(body, br#"{"ok":true}"#);
        assert_eq!(resolver.pending_count().await, 0);
    }

    #[tokio::test]
    async fn dropping_a_pending_reply_forgets_it() {
        let broker = MemoryBroker::new();
        let resolver = resolver(&broker);
        let first = resolver.register("one").unwrap();
        let _second = resolver.register("two").unwrap();
        assert_eq!(resolver.pending_count().await, 2);
        drop(first);
        assert_eq!(resolver.pending_count().await, 1);
    }

    #[tokio::test]
    async fn stream_loss_wakes_pending_calls() {
        let broker = MemoryBroker::new();
        let resolver = resolver(&broker);
        resolver.reply_channel().await.unwrap();
        let mut call = resolver.register("lost").unwrap();
        // make sure the registration landed before severing
        assert_eq!(resolver.pending_count().await, 1);

        broker.sever_connections();
        let err = tokio::time::timeout(Duration::from_secs(1), call.wait()).await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::ReplyLost));

        // a fresh channel is handed out on the next request
        let channel = resolver.reply_channel().await.unwrap();
        reply_address(&broker, &channel).await;
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let resolver = resolver_with(&broker, shutdown.clone());
        resolver.reply_channel().await.unwrap();
        let mut waiting = resolver.register("in-flight").unwrap();
        assert_eq!(resolver.pending_count().await, 1);

        shutdown.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), waiting.wait()).await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Shutdown));

        assert!(resolver.is_stopped());
        assert!(matches!(resolver.reply_channel().await, Err(BusError::Shutdown)));
        assert!(matches!(resolver.register("late"), Err(BusError::Shutdown)));
    }
}
