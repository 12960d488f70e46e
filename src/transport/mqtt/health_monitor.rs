//! Connection state machine, retry policy and health snapshot
//!
//! Nothing here touches the network or the clock beyond `Instant::elapsed`,
//! so the supervisor's decisions can be tested in isolation.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A device that stays quiet this long makes the session unhealthy
const SILENCE_THRESHOLD: Duration = Duration::from_secs(300);

/// Stateless helpers behind the connection manager
pub struct HealthMonitor;

impl HealthMonitor {
    /// Next retry, or why there is none; `max_attempts = None` retries forever
    pub fn should_attempt_reconnection(
        attempts_so_far: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        match config.max_attempts {
            _ if shutdown_requested => ReconnectionDecision::AbortShutdownRequested,
            Some(limit) if attempts_so_far >= limit => {
                ReconnectionDecision::AbortMaxAttemptsExceeded
            }
            _ => {
                let attempt = attempts_so_far.saturating_add(1);
                ReconnectionDecision::Proceed {
                    attempt,
                    delay_ms: config.calculate_backoff_delay(attempt),
                }
            }
        }
    }

    /// Next state for an event, or None when the event does not apply (pure function)
    ///
    /// Legal moves: Disconnected→Connecting on connect, Connecting→Connected on
    /// the device token, Connected→Lost on transport failure, Lost→Connecting
    /// when a retry starts, and any state→Disconnected on stop or when retries
    /// run out. A failure before the device announced itself keeps Connecting.
    pub fn determine_next_state(
        current: &ConnectionState,
        event: &ConnectionEvent,
    ) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (current, event) {
            (Disconnected, ConnectionEvent::ConnectRequested) => Some(Connecting),
            (Connecting, ConnectionEvent::DeviceOnline) => Some(Connected),
            (Connected, ConnectionEvent::TransportFailed(_)) => Some(Lost),
            (Lost, ConnectionEvent::ReconnectScheduled(_)) => Some(Connecting),
            (Connecting | Lost, ConnectionEvent::RetriesExhausted(_)) => Some(Disconnected),
            (Connecting | Connected | Lost, ConnectionEvent::Stopped) => Some(Disconnected),
            _ => None,
        }
    }

    /// Snapshot of session health as of now
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|since| since.elapsed());
        let time_since_last_message = last_message_time.map(|at| at.elapsed());
        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    /// Needs a live broker session; once traffic has been seen it must be recent
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        uptime.is_some() && time_since_last_message.map_or(true, |quiet| quiet < SILENCE_THRESHOLD)
    }

    /// One log line per applied transition, at a level matching its severity
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState, event: &ConnectionEvent) {
        match (from, to, event) {
            (ConnectionState::Disconnected, ConnectionState::Connecting, _) => {
                info!("Connecting to MQTT broker");
            }
            (ConnectionState::Connecting, ConnectionState::Connected, _) => {
                info!("ESP32-CAM online, receiving telemetry");
            }
            (ConnectionState::Connected, ConnectionState::Lost, ConnectionEvent::TransportFailed(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (ConnectionState::Lost, ConnectionState::Connecting, ConnectionEvent::ReconnectScheduled(attempt)) => {
                info!(attempt, "Reconnecting to MQTT broker");
            }
            (_, ConnectionState::Disconnected, ConnectionEvent::RetriesExhausted(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }

    /// Reject backoff settings that would spin or never retry
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1, or unset to retry forever".to_string());
        }
        if config.sustained_delay == 0 {
            return Err("sustained_delay must be positive".to_string());
        }
        match config.backoff_pattern.iter().position(|&delay| delay == 0) {
            Some(index) => Err(format!("backoff_pattern[{index}] must be positive")),
            None => Ok(()),
        }
    }
}

/// Outcome of [`HealthMonitor::should_attempt_reconnection`]
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay_ms`, then retry as attempt number `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Events that drive connection state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Caller asked for a session
    ConnectRequested,
    /// Status topic carried the online token
    DeviceOnline,
    /// Network, TLS or protocol error
    TransportFailed(String),
    /// Backoff elapsed, dialing again
    ReconnectScheduled(u32),
    /// Caller asked to stop
    Stopped,
    /// Reconnect policy gave up
    RetriesExhausted(String),
}

/// Point-in-time session health, see [`ConnectionManager::health_metrics`]
///
/// [`ConnectionManager::health_metrics`]: super::ConnectionManager::health_metrics
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Since the broker last acknowledged the session; `None` while down
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Completed reconnects after the first acknowledgement
    pub reconnect_count: u32,
    pub is_healthy: bool,
}
