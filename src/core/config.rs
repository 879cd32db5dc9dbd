//! Configuration - Type-safe config loaded from `config.toml`
//!
//! Every field has a default, so a partial file (or no file) still yields a
//! runnable bridge.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::types::AccountType;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub venue: VenueConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub trading: TradingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { log_level: default_log_level() }
    }
}

/// Venue-facing TCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_venue_addr")]
    pub listen_addr: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Consecutive unanswered pings before the connection is dropped
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Per-connection outbound queue depth
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl VenueConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_venue_addr(),
            ping_interval_secs: default_ping_interval(),
            max_missed_pongs: default_max_missed_pongs(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_message_bytes: default_max_message_bytes(),
            outbound_buffer: default_outbound_buffer(),
            server_name: default_server_name(),
            protocol_version: default_protocol_version(),
        }
    }
}

/// Subscriber-facing stream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_addr")]
    pub listen_addr: String,
    /// Per-subscriber buffer; overflow drops the newest message
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Capacity of each of the four broadcast inputs
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Longest client command line; longer ones end the session
    #[serde(default = "default_max_command_bytes")]
    pub max_command_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_stream_addr(),
            subscriber_buffer: default_subscriber_buffer(),
            channel_capacity: default_channel_capacity(),
            max_command_bytes: default_max_command_bytes(),
        }
    }
}

/// Lifecycle timing and balance ownership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_placement_timeout")]
    pub placement_timeout_secs: u64,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_modify_timeout")]
    pub modify_timeout_secs: u64,
    #[serde(default = "default_balance_timeout")]
    pub balance_timeout_secs: u64,
    #[serde(default = "default_expiry_sweep")]
    pub expiry_sweep_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Account types whose balance is owned by the venue
    #[serde(default = "default_venue_balance_types")]
    pub venue_balance_types: Vec<AccountType>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            placement_timeout_secs: default_placement_timeout(),
            close_timeout_secs: default_close_timeout(),
            modify_timeout_secs: default_modify_timeout(),
            balance_timeout_secs: default_balance_timeout(),
            expiry_sweep_secs: default_expiry_sweep(),
            reconcile_interval_secs: default_reconcile_interval(),
            venue_balance_types: default_venue_balance_types(),
        }
    }
}

/// Resolved correlation deadlines, handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub placement: Duration,
    pub close: Duration,
    pub modify: Duration,
    pub balance: Duration,
}

impl TradingConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            placement: Duration::from_secs(self.placement_timeout_secs),
            close: Duration::from_secs(self.close_timeout_secs),
            modify: Duration::from_secs(self.modify_timeout_secs),
            balance: Duration::from_secs(self.balance_timeout_secs),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_venue_addr() -> String {
    "0.0.0.0:5001".to_string()
}
fn default_ping_interval() -> u64 {
    30
}
fn default_max_missed_pongs() -> u32 {
    5
}
fn default_read_timeout() -> u64 {
    120
}
fn default_write_timeout() -> u64 {
    10
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_server_name() -> String {
    "VenueBridge".to_string()
}
fn default_protocol_version() -> String {
    "1.0".to_string()
}
fn default_stream_addr() -> String {
    "0.0.0.0:7001".to_string()
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_max_command_bytes() -> usize {
    64 * 1024
}
fn default_placement_timeout() -> u64 {
    30
}
fn default_close_timeout() -> u64 {
    30
}
fn default_modify_timeout() -> u64 {
    10
}
fn default_balance_timeout() -> u64 {
    10
}
fn default_expiry_sweep() -> u64 {
    5
}
fn default_reconcile_interval() -> u64 {
    60
}
fn default_venue_balance_types() -> Vec<AccountType> {
    vec![AccountType::Real]
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> crate::core::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::core::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::core::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// `$BRIDGE_CONFIG`, else `config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var("BRIDGE_CONFIG")
            .unwrap_or_else(|_| "config.toml".to_string())
            .into()
    }

    /// Load `path`, falling back to defaults. The load error is handed back
    /// because logging is not up yet when the config is read.
    pub fn load_or_default(path: &Path) -> (Self, Option<crate::core::Error>) {
        match Self::load(path) {
            Ok(cfg) => (cfg, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}
