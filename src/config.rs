use std::{env, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use container_bus::{BusTimings, RabbitmqSettings};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Read-only source of configuration values.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file when one exists. Values
/// already set in the environment win over the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            info!("no .env at {}, using the process environment", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, used in tests and when embedding a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

// ── container settings ──

pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_HEARTBEAT: &str = "RABBITMQ_HEARTBEAT";
pub const MYTHIC_CONTAINER_NAME: &str = "MYTHIC_CONTAINER_NAME";
pub const RPC_TIMEOUT_SECS: &str = "RPC_TIMEOUT_SECS";
pub const RPC_RETRY_DELAY_MS: &str = "RPC_RETRY_DELAY_MS";
pub const CONNECT_RETRY_DELAY_SECS: &str = "CONNECT_RETRY_DELAY_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{key}` must be {expected}, got `{value}`")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Everything a container process reads from its configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub container_name: Option<String>,
    pub rabbitmq: RabbitmqSettings,
    pub timings: BusTimings,
}

impl ContainerConfig {
    /// Reads the `RABBITMQ_*` and timing keys, falling back to defaults for
    /// anything unset.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let source = config.0.as_ref();
        let mut rabbitmq = RabbitmqSettings::default();
        let mut timings = BusTimings::default();

        if let Some(host) = source.get(RABBITMQ_HOST).await {
            rabbitmq.host = host;
        }
        if let Some(port) = parse::<u16>(source, RABBITMQ_PORT, "a port number").await? {
            rabbitmq.port = port;
        }
        if let Some(vhost) = source.get(RABBITMQ_VHOST).await {
            rabbitmq.vhost = vhost;
        }
        if let Some(user) = source.get(RABBITMQ_USER).await {
            rabbitmq.user = user;
        }
        if let Some(password) = source.get(RABBITMQ_PASSWORD).await {
            rabbitmq.password = password;
        }
        if let Some(heartbeat) = parse::<u16>(source, RABBITMQ_HEARTBEAT, "a number of seconds").await? {
            rabbitmq.heartbeat_secs = heartbeat;
        }
        if let Some(secs) = parse::<u64>(source, RPC_TIMEOUT_SECS, "a number of seconds").await? {
            timings.rpc_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(source, RPC_RETRY_DELAY_MS, "a number of milliseconds").await? {
            timings.rpc_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(source, CONNECT_RETRY_DELAY_SECS, "a number of seconds").await? {
            timings.connect_retry_delay = Duration::from_secs(secs);
            timings.consumer_retry_delay = Duration::from_secs(secs);
        }

        let container_name = source
            .get(MYTHIC_CONTAINER_NAME)
            .await
            .filter(|name| !name.trim().is_empty());
        rabbitmq.connection_name = container_name.clone();

        Ok(Self { container_name, rabbitmq, timings })
    }
}

async fn parse<T: FromStr>(
    source: &dyn ConfigManagerType,
    key: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match source.get(key).await {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value, expected }),
    }
}
