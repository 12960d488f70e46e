//! Scripted in-memory broker session
//!
//! Tests drive the connection manager by pushing events through a
//! [`BrokerScript`]; every session the factory opens reads from the same
//! script, so a reconnect or a second `connect()` keeps consuming it.

use crate::credentials::CredentialError;
use crate::transport::mqtt::{EventRoute, InboundMessage, Subscription, TransportError};
use crate::transport::{BrokerSession, SessionFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};

pub type ScriptedEvent = Result<EventRoute, TransportError>;

/// What the scripted sessions were asked to do
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    /// Client id of every opened session, in order
    pub opened: Vec<String>,
    /// One entry per `subscribe` call
    pub subscriptions: Vec<Vec<Subscription>>,
    pub closed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SessionLogHandle(Arc<StdMutex<SessionLog>>);

impl SessionLogHandle {
    fn update(&self, f: impl FnOnce(&mut SessionLog)) {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn snapshot(&self) -> SessionLog {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.snapshot().opened.len()
    }

    pub fn sessions_closed(&self) -> usize {
        self.snapshot().closed
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<Subscription>> {
        self.snapshot().subscriptions
    }
}

/// Feeds events to the scripted sessions
#[derive(Debug, Clone)]
pub struct BrokerScript {
    events_tx: mpsc::UnboundedSender<ScriptedEvent>,
}

impl BrokerScript {
    pub fn push(&self, event: ScriptedEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn connack(&self, session_present: bool) {
        self.push(Ok(EventRoute::ConnectionAcknowledged { session_present }));
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        self.push(Ok(EventRoute::MessageReceived(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        })));
    }

    /// Simulate a dropped connection
    pub fn fail(&self, reason: &str) {
        self.push(Err(TransportError::Other(reason.to_string())));
    }
}

/// [`SessionFactory`] handing out [`ScriptedSession`]s
pub struct ScriptedSessionFactory {
    events: Arc<Mutex<mpsc::UnboundedReceiver<ScriptedEvent>>>,
    log: SessionLogHandle,
    credential_failure: Option<String>,
    next_id: AtomicUsize,
}

impl ScriptedSessionFactory {
    pub fn new() -> (Self, BrokerScript) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory = Self {
            events: Arc::new(Mutex::new(events_rx)),
            log: SessionLogHandle::default(),
            credential_failure: None,
            next_id: AtomicUsize::new(1),
        };
        (factory, BrokerScript { events_tx })
    }

    /// Factory whose credentials never load
    pub fn failing(reason: &str) -> Self {
        let (mut factory, _script) = Self::new();
        factory.credential_failure = Some(reason.to_string());
        factory
    }

    pub fn log(&self) -> SessionLogHandle {
        self.log.clone()
    }
}

impl SessionFactory for ScriptedSessionFactory {
    type Session = ScriptedSession;

    fn open(&self) -> Result<ScriptedSession, CredentialError> {
        if let Some(reason) = &self.credential_failure {
            return Err(CredentialError::NoPrivateKey(reason.clone()));
        }

        let client_id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.log.update(|log| log.opened.push(client_id.clone()));
        Ok(ScriptedSession {
            events: self.events.clone(),
            log: self.log.clone(),
            client_id,
        })
    }
}

pub struct ScriptedSession {
    events: Arc<Mutex<mpsc::UnboundedReceiver<ScriptedEvent>>>,
    log: SessionLogHandle,
    client_id: String,
}

#[async_trait]
impl BrokerSession for ScriptedSession {
    async fn next_event(&mut self) -> Result<EventRoute, TransportError> {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(event) => event,
            None => {
                drop(events);
                // Script finished; idle like a quiet broker
                std::future::pending().await
            }
        }
    }

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.log
            .update(|log| log.subscriptions.push(subscriptions.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.log.update(|log| log.closed += 1);
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}
