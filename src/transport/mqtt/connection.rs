//! Pure connection state and session configuration
//!
//! Nothing here performs I/O: state values, the reconnect policy, transport
//! errors, the topic subscriptions and the translation of provisioned
//! credentials into rumqttc options.

use crate::config::{SessionSection, TopicsSection};
use crate::credentials::{BrokerConfig, TlsContext};
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection state observed by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session, either never started or explicitly stopped
    Disconnected,
    /// Session open, waiting for the device to announce itself
    Connecting,
    /// The device published its online token
    Connected,
    /// Transport failed while connected; a retry is pending
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2000, 5000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Total backoff across all attempts; None for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Recoverable transport failures; absorbed by the session supervisor
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Broker rejected subscription to {0}")]
    SubscriptionRejected(String),
    #[error("Timed out waiting for state {expected}, current state is {actual}")]
    StateTimeout {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    #[error("Transport failure: {0}")]
    Other(String),
}

/// One topic filter to subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// Status and data subscriptions, both at-least-once
pub fn build_subscriptions(topics: &TopicsSection) -> Vec<Subscription> {
    [&topics.status, &topics.data]
        .into_iter()
        .map(|topic| Subscription {
            topic: topic.clone(),
            qos: QoS::AtLeastOnce,
        })
        .collect()
}

/// Incoming and outgoing packet limit
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Build rumqttc options for one session
///
/// The broker keeps subscriptions across reconnects (`clean_session = false`)
/// and the transport is always mutual TLS.
pub fn configure_mqtt_options(
    broker: &BrokerConfig,
    tls: &TlsContext,
    session: &SessionSection,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&broker.client_id, &broker.endpoint, broker.port);
    mqtt_options.set_clean_session(false);
    mqtt_options.set_keep_alive(Duration::from_secs(session.keep_alive_secs));
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    let client_config = tls.client_config(&session.alpn_protocols);
    mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
        client_config,
    )));

    mqtt_options
}
