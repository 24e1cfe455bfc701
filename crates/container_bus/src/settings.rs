use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BusError, BusResult};

/// Where the broker lives and how to log in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RabbitmqSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    /// Heartbeat interval negotiated with the broker, in seconds.
    pub heartbeat_secs: u16,
    /// Shows up in the broker's connection list.
    pub connection_name: Option<String>,
}

impl Default for RabbitmqSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            vhost: "mythic_vhost".to_string(),
            user: "mythic_user".to_string(),
            password: String::new(),
            heartbeat_secs: 30,
            connection_name: None,
        }
    }
}

impl RabbitmqSettings {
    /// Builds the `amqp://` URI, percent-encoding credentials and vhost.
    pub fn amqp_uri(&self) -> BusResult<String> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| BusError::Settings(format!("bad host/port `{}:{}`: {e}", self.host, self.port)))?;
        url.set_username(&self.user)
            .map_err(|_| BusError::Settings("cannot set username".to_string()))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password))
                .map_err(|_| BusError::Settings("cannot set password".to_string()))?;
        }
        // the vhost is a single path segment, so a `/` inside it must be escaped
        url.path_segments_mut()
            .map_err(|_| BusError::Settings("amqp url cannot carry a vhost".to_string()))?
            .clear()
            .push(&self.vhost);
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat_secs.to_string());
        Ok(url.to_string())
    }
}

/// Retry and timeout knobs of the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTimings {
    /// Pause between failed connection attempts.
    pub connect_retry_delay: Duration,
    /// Pause before a consumer loop rebuilds its channel/queue/binding.
    pub consumer_retry_delay: Duration,
    /// How long one RPC attempt waits for its reply.
    pub rpc_timeout: Duration,
    /// Pause between RPC attempts.
    pub rpc_retry_delay: Duration,
    /// Bound on waiting for a publisher confirm.
    pub confirm_timeout: Duration,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_secs(5),
            consumer_retry_delay: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            rpc_retry_delay: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}
