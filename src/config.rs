//! # Configuration Management
//!
//! Centralized configuration for the network engine.
//!
//! Every struct derives `serde` traits and has working defaults, so an embedding
//! application can build the configuration however it likes. The crate itself only
//! reads defaults and `NETCORE_*` environment overrides; file formats are left to the
//! application.
//!
//! ## Sections
//! - **server**: listener addresses and admission limits
//! - **transport**: codec knobs (compression threshold, payload format, packet size)
//! - **queues**: packet queue, request queue, worker pool, writer shards
//! - **session**: idle and orphan detection
//! - **kcp**: reliable UDP tuning
//! - **logging**: tracing subscriber setup

use crate::core::codec::{DEFAULT_COMPRESSION_THRESHOLD, MAX_PACKET_SIZE};
use crate::core::serialization::DataType;
use crate::error::{NetworkError, Result};
use crate::security::filter::DEFAULT_MAX_CONNECTIONS_PER_IP;
use crate::utils::compression::CompressionKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub kcp: KcpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl NetworkConfig {
    /// Defaults overridden by `NETCORE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("NETCORE_TCP_ADDRESS") {
            config.server.tcp_address = Some(addr);
        }
        if let Ok(addr) = std::env::var("NETCORE_UDP_ADDRESS") {
            config.server.udp_address = Some(addr);
        }
        if let Ok(addr) = std::env::var("NETCORE_WEBSOCKET_ADDRESS") {
            config.server.websocket_address = Some(addr);
        }
        if let Ok(addr) = std::env::var("NETCORE_KCP_ADDRESS") {
            config.server.kcp_address = Some(addr);
        }
        if let Some(val) = env_parse("NETCORE_MAX_CONNECTIONS_PER_IP") {
            config.server.max_connections_per_ip = val;
        }
        if let Some(val) = env_parse("NETCORE_COMPRESSION_THRESHOLD_BYTES") {
            config.transport.compression_threshold_bytes = val;
        }
        if let Some(val) = env_parse("NETCORE_PACKET_QUEUE_SIZE") {
            config.queues.packet_queue_size = val;
        }
        if let Some(val) = env_parse("NETCORE_REQUEST_QUEUE_SIZE") {
            config.queues.request_queue_size = val;
        }
        if let Some(val) = env_parse("NETCORE_WORKER_THREADS") {
            config.queues.worker_threads = val;
        }
        if let Some(val) = env_parse("NETCORE_WRITER_SHARDS") {
            config.queues.writer_shards = val;
        }
        if let Some(val) = env_parse::<u64>("NETCORE_WRITE_TIMEOUT_MS") {
            config.transport.write_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("NETCORE_MAX_IDLE_TIME_SECS") {
            config.session.max_idle_time = Duration::from_secs(val);
        }
        if let Ok(kind) = std::env::var("NETCORE_DATA_TYPE") {
            config.transport.data_type = match kind.to_ascii_lowercase().as_str() {
                "zero" => DataType::Zero,
                "msgpack" => DataType::MsgPack,
                other => {
                    return Err(NetworkError::ConfigError(format!(
                        "Unknown data type in NETCORE_DATA_TYPE: {other}"
                    )))
                }
            };
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.queues.validate());
        errors.extend(self.kcp.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener addresses and admission limits. A transport without an address is not started.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub tcp_address: Option<String>,
    pub udp_address: Option<String>,
    pub websocket_address: Option<String>,
    pub kcp_address: Option<String>,

    pub max_connections_per_ip: usize,

    /// Time allowed for tasks to finish after shutdown is requested
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_address: Some(String::from("127.0.0.1:8032")),
            udp_address: None,
            websocket_address: None,
            kcp_address: None,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let addresses = [
            ("tcp", &self.tcp_address),
            ("udp", &self.udp_address),
            ("websocket", &self.websocket_address),
            ("kcp", &self.kcp_address),
        ];
        for (name, address) in addresses {
            if let Some(address) = address {
                if address.parse::<SocketAddr>().is_err() {
                    errors.push(format!(
                        "Invalid {name} address format: '{address}' (expected format: '0.0.0.0:8032')"
                    ));
                }
            }
        }
        if addresses.iter().all(|(_, a)| a.is_none()) {
            errors.push("At least one transport address must be configured".to_string());
        }

        if self.max_connections_per_ip == 0 {
            errors.push("max_connections_per_ip must be greater than 0".to_string());
        }

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Payloads strictly larger than this are compressed
    pub compression_threshold_bytes: usize,

    /// Install a compressor. Without one, large payloads are sent uncompressed and
    /// compressed inbound packets are refused.
    pub compression_enabled: bool,

    pub compression_kind: CompressionKind,

    pub max_packet_size: usize,

    /// Payload format shared with clients
    pub data_type: DataType,

    /// Length of pooled socket read buffers
    pub read_buffer_size: usize,

    pub read_buffer_pool_size: usize,

    /// How long a stream peer may keep its receive window shut, or a WebSocket
    /// batch may take, before the session is closed
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            compression_enabled: true,
            compression_kind: CompressionKind::Lz4,
            max_packet_size: MAX_PACKET_SIZE,
            data_type: DataType::Zero,
            read_buffer_size: 64 * 1024,
            read_buffer_pool_size: 32,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packet_size < 16 {
            errors.push(format!(
                "Max packet size too small: {} bytes (minimum: 16)",
                self.max_packet_size
            ));
        } else if self.max_packet_size > u32::MAX as usize {
            errors.push("Max packet size cannot exceed the 32-bit length field".to_string());
        }

        if self.compression_enabled && self.compression_threshold_bytes > self.max_packet_size {
            errors.push("Compression threshold cannot be larger than max packet size".to_string());
        }

        if self.read_buffer_size < 512 {
            errors.push(format!(
                "Read buffer too small: {} bytes (minimum: 512)",
                self.read_buffer_size
            ));
        }

        if self.write_timeout < Duration::from_millis(10) {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Outbound packets buffered per session channel
    pub packet_queue_size: usize,

    /// Shed low-priority packets as queues fill up
    pub shedding_enabled: bool,

    /// Inbound requests buffered by the controller
    pub request_queue_size: usize,

    /// Order requests by priority, then age. Plain FIFO when false.
    pub priority_ordering: bool,

    pub worker_threads: usize,

    /// Writer tasks draining session queues
    pub writer_shards: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            packet_queue_size: 100,
            shedding_enabled: true,
            request_queue_size: 50,
            priority_ordering: true,
            worker_threads: 5,
            writer_shards: 4,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.packet_queue_size == 0 {
            errors.push("Packet queue size must be greater than 0".to_string());
        }
        if self.request_queue_size == 0 {
            errors.push("Request queue size must be greater than 0".to_string());
        }
        if self.worker_threads == 0 {
            errors.push("Worker pool needs at least one worker".to_string());
        } else if self.worker_threads > 1024 {
            errors.push(format!(
                "Too many workers: {} (max recommended: 1024)",
                self.worker_threads
            ));
        }
        if self.writer_shards == 0 {
            errors.push("At least one writer shard is required".to_string());
        }

        errors
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions without activity for longer than this are closed. Zero disables the check.
    #[serde(with = "duration_serde")]
    pub max_idle_time: Duration,

    /// Close sessions the application never associated within the allowance
    pub orphan_check: bool,

    #[serde(with = "duration_serde")]
    pub scan_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(180),
            orphan_check: false,
            scan_interval: Duration::from_secs(1),
        }
    }
}

/// Reliable UDP tuning, passed straight to every KCP channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KcpConfig {
    pub no_delay: bool,

    /// Internal update interval in milliseconds, also the tick of the update loop
    pub update_interval: u32,

    /// Fast retransmit after this many skipped acks (0 disables)
    pub fast_resend: u32,

    pub congestion_control: bool,

    pub send_window: u16,

    pub receive_window: u16,

    /// Detach a KCP channel that received nothing for this long
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            update_interval: 10,
            fast_resend: 2,
            congestion_control: false,
            send_window: 128,
            receive_window: 128,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl KcpConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.update_interval < 5 || self.update_interval > 5000 {
            errors.push(format!(
                "KCP update interval out of range: {}ms (valid range: 5-5000)",
                self.update_interval
            ));
        }
        if self.send_window == 0 || self.receive_window == 0 {
            errors.push("KCP windows must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Honour `RUST_LOG` over `log_level` when set
    pub env_filter: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netcore"),
            log_level: Level::INFO,
            json_format: false,
            env_filter: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
