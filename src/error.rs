//! Crate-level error type
//!
//! Each layer owns its own error enum; `MonitorError` is what the binary
//! and other top-level callers deal with.

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::telemetry::DecodeError;
use crate::transport::mqtt::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MonitorError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MonitorError::Transport(_) | MonitorError::Decode(_))
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
