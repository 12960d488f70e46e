//! Single-writer connection state holder
//!
//! The current state lives in a `watch` channel so readers get cheap
//! snapshots and change notifications; every applied transition is also
//! broadcast so observers can follow the full history.

use super::connection::{ConnectionState, TransportError};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use crate::telemetry::LivenessSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// One applied state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Owner of the authoritative [`ConnectionState`]
///
/// Clones share the same state. Only the connection manager and the topic
/// router hold one; consumers get a [`StateObserver`].
#[derive(Debug, Clone)]
pub struct ConnectionStateCell {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    transitions_tx: broadcast::Sender<StateTransition>,
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateCell {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state_tx: Arc::new(state_tx),
            transitions_tx,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Apply an event; returns the transition when the state changed
    ///
    /// The broadcast happens while the state is locked, so transitions are
    /// delivered in the order they were applied.
    pub fn apply(&self, event: ConnectionEvent) -> Option<StateTransition> {
        let mut applied = None;
        self.state_tx.send_if_modified(|state| {
            let Some(next) = HealthMonitor::determine_next_state(state, &event) else {
                return false;
            };
            if next == *state {
                return false;
            }
            let transition = StateTransition {
                from: *state,
                to: next,
            };
            HealthMonitor::log_state_transition(&transition.from, &transition.to, &event);
            *state = next;
            // No receivers is fine
            let _ = self.transitions_tx.send(transition);
            applied = Some(transition);
            true
        });
        applied
    }

    pub fn observer(&self) -> StateObserver {
        StateObserver {
            state_rx: self.state_tx.subscribe(),
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }
}

impl LivenessSignal for ConnectionStateCell {
    fn device_online(&self) -> bool {
        self.apply(ConnectionEvent::DeviceOnline).is_some()
    }
}

/// Read-only view of the connection state
#[derive(Debug, Clone)]
pub struct StateObserver {
    state_rx: watch::Receiver<ConnectionState>,
}

impl StateObserver {
    pub fn current(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait for the next change; None once the manager is gone
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.state_rx.changed().await.ok()?;
        Some(*self.state_rx.borrow_and_update())
    }

    /// Wait until the state equals `target`
    pub async fn wait_for(
        &mut self,
        target: ConnectionState,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let reached = tokio::time::timeout(timeout, self.state_rx.wait_for(|s| *s == target))
            .await
            .map(|result| result.is_ok());
        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Other(
                "connection manager dropped".to_string(),
            )),
            Err(_) => Err(TransportError::StateTimeout {
                expected: target,
                actual: self.current(),
            }),
        }
    }
}
