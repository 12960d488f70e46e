//! Mutual-TLS MQTT connection management
//!
//! Pure logic is kept apart from I/O so the state machine can be tested
//! without a broker:
//!
//! - [`connection`] - state values, reconnect policy, errors and rumqttc options
//! - [`health_monitor`] - transition rules, retry decisions and health metrics
//! - [`message_handler`] - classification of rumqttc events
//! - [`state`] - the shared state holder and its observers
//! - [`session`] - the rumqttc-backed [`BrokerSession`](crate::transport::BrokerSession)
//! - [`client`] - the [`ConnectionManager`] and its background tasks
//!
//! # Usage
//!
//! ```rust,no_run
//! use esp32cam_monitor::config::MonitorConfig;
//! use esp32cam_monitor::transport::mqtt::{ConnectionManager, ConnectionState};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = MonitorConfig::default();
//! let manager = ConnectionManager::new(&config);
//! manager.connect().await?;
//!
//! let mut state = manager.observe_state();
//! state.wait_for(ConnectionState::Connected, Duration::from_secs(30)).await?;
//!
//! let mut records = manager.telemetry().observe();
//! while let Some(record) = records.next().await {
//!     println!("{record}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod session;
pub mod state;

pub use client::ConnectionManager;
pub use connection::{
    build_subscriptions, configure_mqtt_options, ConnectionState, ReconnectConfig, Subscription,
    TransportError,
};
pub use health_monitor::{
    ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, InboundMessage, MessageHandler};
pub use session::{MqttSession, MqttSessionFactory};
pub use state::{ConnectionStateCell, StateObserver, StateTransition};
