//! ESP32-CAM telemetry monitor
//!
//! Connects to an MQTT broker over mutual TLS, watches the camera's status
//! topic for its online announcement, and decodes object detection results
//! from the data topic into an ordered telemetry feed.
//!
//! # Overview
//!
//! - [`credentials`] loads the broker endpoint and X.509 identity from bundled
//!   assets, converting legacy PKCS#1 keys, and builds the TLS configuration.
//! - [`transport::mqtt::ConnectionManager`] owns the single broker session,
//!   the connection state machine and automatic reconnection.
//! - [`telemetry`] routes publishes by topic, decodes detection payloads and
//!   keeps the append-only record log consumers subscribe to.
//!
//! # Quick Start
//!
//! ```rust
//! use esp32cam_monitor::telemetry::{PayloadDecoder, PayloadSchema};
//!
//! let decoder = PayloadDecoder::new(PayloadSchema::detections());
//! let records = decoder
//!     .decode(br#"{"objects": [{"label": "person", "distance": 1.2, "risk_level": "high"}]}"#)
//!     .unwrap();
//! assert_eq!(records[0].to_string(), "person 1.2 high");
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod observability;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, MonitorConfig};
pub use credentials::{CredentialError, Provisioner};
pub use error::{MonitorError, MonitorResult};
pub use telemetry::{DecodeError, TelemetryFeed, TelemetryRecord};
pub use transport::mqtt::{ConnectionManager, ConnectionState, TransportError};
