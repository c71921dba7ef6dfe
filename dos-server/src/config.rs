use dos_core::{DataNodeOptions, DosError, NameNodeOptions, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameNodeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_replication")]
    pub replication: usize,
    #[serde(default)]
    pub tolerance: usize,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub namespace_file: Option<PathBuf>,
    /// 0 waits for create acks without a bound.
    #[serde(default = "default_create_ack_timeout_ms")]
    pub create_ack_timeout_ms: u64,
    #[serde(default)]
    pub initial_sequence: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_replication() -> usize {
    2
}

fn default_create_ack_timeout_ms() -> u64 {
    5000
}

impl Default for NameNodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            replication: default_replication(),
            tolerance: 0,
            log_file: None,
            namespace_file: None,
            create_ack_timeout_ms: default_create_ack_timeout_ms(),
            initial_sequence: 0,
        }
    }
}

impl NameNodeConfig {
    pub fn options(&self) -> NameNodeOptions {
        NameNodeOptions {
            replication: self.replication,
            tolerance: self.tolerance,
            create_ack_timeout: match self.create_ack_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            namespace_file: self.namespace_file.clone(),
            initial_sequence: self.initial_sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeConfig {
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_name_node")]
    pub name_node: String,
    #[serde(default = "default_store")]
    pub store: PathBuf,
    #[serde(default)]
    pub lease_addr: String,
    #[serde(default)]
    pub initial_sequence: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_queue")]
    pub queue: QueueBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_name_node() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_store() -> PathBuf {
    PathBuf::from("data.db")
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_queue() -> QueueBackend {
    QueueBackend::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for DataNodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            name_node: default_name_node(),
            store: default_store(),
            lease_addr: String::new(),
            initial_sequence: 0,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            queue: default_queue(),
            redis_url: default_redis_url(),
            log_file: None,
        }
    }
}

impl DataNodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(DosError::Config("node_id is required".to_string()));
        }
        if self.lease_addr.trim().is_empty() {
            return Err(DosError::Config("lease_addr is required".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(DosError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_endpoint(&self) -> String {
        format!("ws://{}", self.lease_addr)
    }

    pub fn options(&self, initial_sequence: u64) -> DataNodeOptions {
        DataNodeOptions {
            node_id: self.node_id.clone(),
            lease_endpoint: self.lease_endpoint(),
            initial_sequence,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }
}

/// Read `path` (any format the config crate understands) overlaid with
/// `DOS_`-prefixed environment variables. Without a path only the
/// environment and defaults apply.
pub fn load<T: DeserializeOwned>(path: Option<&str>) -> Result<T> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::with_name(path));
    }

    let settings = builder
        .add_source(::config::Environment::with_prefix("DOS"))
        .build()
        .map_err(|e| DosError::Config(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| DosError::Config(e.to_string()))
}
