// ABOUTME: Configuration for the terminal bridge loaded from TOML with environment overrides
// Covers the control plane, transport channel, flow control, delivery and reconnect policy

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::terminal::codec::DEFAULT_MAX_PAYLOAD;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub control_plane: ControlPlaneConfig,
    pub transport: TransportConfig,
    pub flow_control: FlowControlConfig,
    pub delivery: DeliveryConfig,
    pub protocol: ProtocolConfig,
    pub reconnect: ReconnectConfig,
    pub fit: FitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL of the dashboard API, e.g. `http://localhost:8000`
    pub api_url: String,
    /// Bearer token forwarded to the control plane
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            token: None,
            request_timeout_ms: 30_000,
        }
    }
}

/// What `send` does while the channel is not yet open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SendPolicy {
    Reject,
    Buffer { capacity: usize },
}

impl Default for SendPolicy {
    fn default() -> Self {
        SendPolicy::Buffer { capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket base URL; derived from the API URL when unset
    pub ws_url: Option<String>,
    pub connect_timeout_ms: u64,
    /// Zero disables the heartbeat
    pub heartbeat_interval_ms: u64,
    pub send_policy: SendPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            send_policy: SendPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Credit restored by a resume frame, and the starting credit
    pub credit_limit: u64,
    /// Charge each input payload against the credit
    pub metered: bool,
    /// Fail a stalled input send after this long; unset waits forever
    pub backpressure_timeout_ms: Option<u64>,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            credit_limit: 64 * 1024,
            metered: false,
            backpressure_timeout_ms: None,
        }
    }
}

impl FlowControlConfig {
    pub fn backpressure_timeout(&self) -> Option<Duration> {
        self.backpressure_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event when a subscriber queue is full
    DropOldest,
    /// Ask the remote to pause at the high-water mark
    Backpressure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::Backpressure,
            high_water: 768,
            low_water: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_payload_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 2_000,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Horizontal pixels reserved for the scrollbar
    pub scrollbar_width: f64,
    /// Padding inside the container on every side, in pixels
    pub padding: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            scrollbar_width: 0.0,
            padding: 0.0,
        }
    }
}

impl AppConfig {
    /// Load from the default location, falling back to defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "term-bridge", "term-bridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TERM_BRIDGE_API_URL") {
            self.control_plane.api_url = url;
        }
        if let Ok(token) = std::env::var("TERM_BRIDGE_TOKEN") {
            self.control_plane.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let delivery = &self.delivery;
        if delivery.queue_capacity == 0 {
            return Err(ConfigError::Invalid("delivery.queue_capacity must be > 0".into()));
        }
        if delivery.low_water >= delivery.high_water || delivery.high_water > delivery.queue_capacity {
            return Err(ConfigError::Invalid(
                "delivery watermarks must satisfy low_water < high_water <= queue_capacity".into(),
            ));
        }
        if self.flow_control.credit_limit == 0 {
            return Err(ConfigError::Invalid("flow_control.credit_limit must be >= 1".into()));
        }
        if self.protocol.max_payload_bytes == 0 || self.protocol.max_payload_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "protocol.max_payload_bytes must fit in the u32 length header".into(),
            ));
        }
        if let SendPolicy::Buffer { capacity: 0 } = self.transport.send_policy {
            return Err(ConfigError::Invalid("send buffer capacity must be > 0".into()));
        }
        Ok(())
    }

    /// WebSocket base URL for terminal endpoints.
    pub fn ws_base_url(&self) -> String {
        if let Some(url) = &self.transport.ws_url {
            return url.trim_end_matches('/').to_string();
        }
        let api = self.control_plane.api_url.trim_end_matches('/');
        if let Some(rest) = api.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = api.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            api.to_string()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[control_plane]
api_url = "https://dashboard.example.com"

[delivery]
overflow = "drop_oldest"

[transport.send_policy]
mode = "reject"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.control_plane.api_url, "https://dashboard.example.com");
        assert_eq!(config.delivery.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.delivery.queue_capacity, 1024);
        assert_eq!(config.transport.send_policy, SendPolicy::Reject);
        assert_eq!(config.ws_base_url(), "wss://dashboard.example.com");
    }

    #[test]
    fn test_invalid_watermarks_rejected() {
        let mut config = AppConfig::default();
        config.delivery.low_water = 900;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let mut config = AppConfig::default();
        config.transport.ws_url = Some("ws://proxy:9000/".to_string());
        assert_eq!(config.ws_base_url(), "ws://proxy:9000");
    }
}
