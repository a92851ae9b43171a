//! Configuration loading and parsing (config.toml)

use crate::client::{self, ClientConfig};
use crate::distributor::{self, DistributorConfig};
use crate::server::{self, ServerConfig};
use crate::source::SimulatedSource;
use anyhow::{ensure, Context, Result};
use can_frame_decoder::Decoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// IDs the simulated source cycles through when nothing else is configured
pub const DEFAULT_SIMULATED_IDS: &[u32] = &[0x100, 0x200, 0x300];

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub transport_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: server::DEFAULT_BIND.to_string(),
            port: server::DEFAULT_PORT,
            queue_capacity: distributor::DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval_secs: distributor::DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            transport_buffer: server::DEFAULT_TRANSPORT_BUFFER,
        }
    }
}

impl ServerSettings {
    /// Convert file settings into the runtime server config
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind.clone(),
            port: self.port,
            transport_buffer: self.transport_buffer,
            distributor: DistributorConfig {
                queue_capacity: self.queue_capacity,
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            },
        }
    }
}

/// Simulated frame source
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSettings {
    pub name: String,
    pub interval_ms: u64,
    /// Frame IDs to emit; empty means every message of the DBC files
    pub ids: Vec<u32>,
    pub dbc_files: Vec<PathBuf>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            interval_ms: 10,
            ids: Vec::new(),
            dbc_files: Vec::new(),
        }
    }
}

impl SourceSettings {
    /// Load the DBC files (if any) and build the simulated source
    pub fn build_source(&self) -> Result<SimulatedSource> {
        let interval = Duration::from_millis(self.interval_ms);

        if self.dbc_files.is_empty() {
            let ids = if self.ids.is_empty() {
                DEFAULT_SIMULATED_IDS.to_vec()
            } else {
                self.ids.clone()
            };
            return Ok(SimulatedSource::new(self.name.clone(), ids, interval));
        }

        let mut decoder = Decoder::new();
        for path in &self.dbc_files {
            decoder
                .add_dbc(path)
                .with_context(|| format!("Failed to load DBC file: {:?}", path))?;
        }
        let stats = decoder.database_stats();
        log::info!(
            "Simulating {} messages ({} signals) from {} DBC files",
            stats.num_messages,
            stats.num_signals,
            self.dbc_files.len()
        );

        Ok(SimulatedSource::new(self.name.clone(), self.ids.clone(), interval)
            .with_catalog(Arc::new(decoder.into_catalog())))
    }
}

/// Settings for `monitor`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub batch_interval_ms: u64,
    pub batch_size: usize,
    pub history_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: client::DEFAULT_URL.to_string(),
            connect_timeout_ms: client::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            heartbeat_interval_ms: client::DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            reconnect_delay_ms: client::DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_reconnect_attempts: client::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            batch_interval_ms: client::DEFAULT_BATCH_INTERVAL.as_millis() as u64,
            batch_size: client::DEFAULT_BATCH_SIZE,
            history_capacity: client::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ClientSettings {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            batch_size: self.batch_size,
            history_capacity: self.history_capacity,
        }
    }
}

impl AppConfig {
    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.server.queue_capacity > 0, "server.queue_capacity must be positive");
        ensure!(
            self.server.heartbeat_interval_secs > 0,
            "server.heartbeat_interval_secs must be positive"
        );
        ensure!(self.source.interval_ms > 0, "source.interval_ms must be positive");
        ensure!(self.client.batch_size > 0, "client.batch_size must be positive");
        ensure!(self.client.batch_interval_ms > 0, "client.batch_interval_ms must be positive");
        ensure!(
            self.client.heartbeat_interval_ms > 0,
            "client.heartbeat_interval_ms must be positive"
        );
        ensure!(self.client.history_capacity > 0, "client.history_capacity must be positive");
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
