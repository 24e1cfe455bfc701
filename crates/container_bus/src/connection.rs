use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::{sync::Mutex, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    broker::{Broker, BrokerConnection},
    metrics::metrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Snapshot {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
}

/// Owns the single broker connection of the process.
///
/// `get_connection` is safe to call from any number of tasks: connecting is
/// serialized behind an async mutex, so a dead link is replaced exactly once.
/// Callers must not hold on to the returned connection for long; ask again
/// after any failure.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
    snapshot: RwLock<Snapshot>,
    retry_delay: Duration,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, retry_delay: Duration) -> Self {
        Self {
            broker,
            current: Mutex::new(None),
            snapshot: RwLock::new(Snapshot { state: ConnectionState::Disconnected, connection: None }),
            retry_delay,
        }
    }

    /// A link that died since it was handed out reads as `Connecting`: the
    /// next caller of [`get_connection`](Self::get_connection) replaces it.
    pub fn state(&self) -> ConnectionState {
        let snapshot = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match snapshot.state {
            ConnectionState::Connected if !snapshot.connection.as_ref().is_some_and(|c| c.is_connected()) => {
                ConnectionState::Connecting
            }
            state => state,
        }
    }

    fn set_state(&self, state: ConnectionState, connection: Option<Arc<dyn BrokerConnection>>) {
        *self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Snapshot { state, connection };
    }

    /// Returns a live connection, connecting (forever, if need be) first.
    pub async fn get_connection(&self) -> Arc<dyn BrokerConnection> {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.as_ref() {
            if connection.is_connected() {
                return connection.clone();
            }
            warn!("🔌 broker link to {} lost, reconnecting", self.broker.describe());
            *current = None;
        }

        self.set_state(ConnectionState::Connecting, None);
        // dropped mid-connect (cancelled caller): nobody is connecting any more
        let mut connecting = ConnectingGuard { manager: self, armed: true };
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            metrics().connection_attempts.add(1, &[]);
            match self.broker.connect().await {
                Ok(connection) => {
                    info!("connected to {} (attempt {attempt})", self.broker.describe());
                    *current = Some(connection.clone());
                    connecting.armed = false;
                    self.set_state(ConnectionState::Connected, Some(connection.clone()));
                    return connection;
                }
                Err(err) => {
                    metrics().connection_failures.add(1, &[]);
                    error!(
                        "❌ failed to connect to {} (attempt {attempt}): {err}; retrying in {:?}",
                        self.broker.describe(),
                        self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Like [`get_connection`](Self::get_connection) but gives up when
    /// `cancel` fires.
    pub async fn get_connection_until(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Arc<dyn BrokerConnection>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            connection = self.get_connection() => Some(connection),
        }
    }
}

struct ConnectingGuard<'a> {
    manager: &'a ConnectionManager,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.set_state(ConnectionState::Disconnected, None);
        }
    }
}
