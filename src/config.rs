//! Settings file for the ESP32-CAM monitor
//!
//! Every section is optional; a missing file section falls back to the values
//! the camera firmware and the bundled AWS IoT assets use out of the box.

use crate::telemetry::PayloadSchema;
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level monitor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default)]
    pub assets: AssetsSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub schema: PayloadSchema,
}

/// Location of the bundled broker endpoint and X.509 material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetsSection {
    /// Directory holding every asset below
    pub dir: PathBuf,
    /// JSON file with `{"endpoint": ..., "port": ...}`
    pub broker_config: String,
    pub root_ca: String,
    pub client_cert: String,
    pub client_key: String,
}

impl Default for AssetsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("certs"),
            broker_config: "aws_config.json".to_string(),
            root_ca: "rootCA.pem".to_string(),
            client_cert: "cert.crt".to_string(),
            client_key: "private.key".to_string(),
        }
    }
}

/// MQTT session tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    /// Prefix of the per-session client id
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Bound of the channel between the network task and the dispatcher
    pub channel_capacity: usize,
    /// ALPN protocols offered during the TLS handshake (AWS IoT on 443 wants `x-amzn-mqtt-ca`)
    pub alpn_protocols: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id_prefix: "esp32cam-monitor".to_string(),
            keep_alive_secs: 60,
            channel_capacity: 64,
            alpn_protocols: Vec::new(),
        }
    }
}

/// The two fixed topics the camera pipeline publishes on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicsSection {
    /// Liveness topic
    pub status: String,
    /// Detection results topic
    pub data: String,
    /// Payload on the status topic announcing the device is up
    pub status_token: String,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            status: "esp32cam/status".to_string(),
            data: "esp32cam/processed".to_string(),
            status_token: "connected".to_string(),
        }
    }
}

/// Reconnection backoff, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    /// Unset means retry forever
    pub max_attempts: Option<u32>,
    pub backoff_pattern_ms: Vec<u64>,
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff_pattern_ms: defaults.backoff_pattern,
            sustained_delay_ms: defaults.sustained_delay,
        }
    }
}

impl ReconnectSection {
    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.max_attempts,
            backoff_pattern: self.backoff_pattern_ms.clone(),
            sustained_delay: self.sustained_delay_ms,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid topic {name}: {reason}")]
    InvalidTopic { name: &'static str, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic("status", &self.topics.status)?;
        validate_topic("data", &self.topics.data)?;
        if self.topics.status == self.topics.data {
            return Err(ConfigError::InvalidTopic {
                name: "data",
                reason: "must differ from the status topic".to_string(),
            });
        }
        if self.topics.status_token.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "topics.status_token must not be empty".to_string(),
            ));
        }

        if self.session.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if !(5..=u64::from(u16::MAX)).contains(&self.session.keep_alive_secs) {
            return Err(ConfigError::InvalidConfig(format!(
                "session.keep_alive_secs must be between 5 and {}",
                u16::MAX
            )));
        }
        let prefix = &self.session.client_id_prefix;
        if prefix.is_empty() || prefix.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidConfig(
                "session.client_id_prefix must be non-empty and not start with whitespace"
                    .to_string(),
            ));
        }

        crate::transport::mqtt::HealthMonitor::validate_connection_config(
            &self.reconnect.to_reconnect_config(),
        )
        .map_err(|e| ConfigError::InvalidConfig(format!("reconnect: {e}")))?;

        self.schema
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("schema: {e}")))?;

        Ok(())
    }

    /// Replace the asset directory, e.g. from a command line flag
    pub fn with_asset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.assets.dir = dir.into();
        self
    }
}

/// Subscriptions are exact-match; wildcards would break topic routing
fn validate_topic(name: &'static str, topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::InvalidTopic {
            name,
            reason: "must not be empty".to_string(),
        });
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(ConfigError::InvalidTopic {
            name,
            reason: format!("'{topic}' must not contain MQTT wildcards"),
        });
    }
    Ok(())
}
