//! Connection manager: the impure half of the MQTT transport
//!
//! `connect()` opens one session and spawns two tasks. The supervisor polls
//! the session, handles ConnAck, subscriptions and reconnect backoff, and
//! forwards publishes over a bounded channel. The dispatcher runs the topic
//! router on each publish in arrival order.
//!
//! Every transport failure starts a new connection generation. Publishes are
//! tagged with the generation they arrived on, so a status token still queued
//! when the link dropped cannot mark the next connection online.

use super::connection::{build_subscriptions, ConnectionState, ReconnectConfig, Subscription};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundMessage, MessageHandler};
use super::session::MqttSessionFactory;
use super::state::{ConnectionStateCell, StateObserver, StateTransition};
use super::TransportError;
use crate::config::{MonitorConfig, TopicsSection};
use crate::credentials::CredentialError;
use crate::mqtt_span;
use crate::telemetry::{
    telemetry_channel, PayloadDecoder, PayloadSchema, TelemetryFeed, TelemetrySink, TopicRouter,
};
use crate::transport::{BrokerSession, SessionFactory};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `disconnect()` waits for each background task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct SessionStats {
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    reconnect_count: u32,
}

#[derive(Debug, Clone, Default)]
struct SharedStats(Arc<StdMutex<SessionStats>>);

impl SharedStats {
    fn update(&self, f: impl FnOnce(&mut SessionStats)) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    fn metrics(&self) -> HealthMetrics {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        HealthMonitor::calculate_health_metrics(
            guard.connect_time,
            guard.last_message_time,
            guard.reconnect_count,
        )
    }
}

/// Number of transport failures seen by one session
#[derive(Debug, Clone, Default)]
struct ConnectionGeneration(Arc<AtomicU64>);

impl ConnectionGeneration {
    fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A publish and the connection generation it arrived on
#[derive(Debug)]
struct Dispatch {
    generation: u64,
    message: InboundMessage,
}

/// Background tasks of one open session
struct ActiveSession {
    client_id: String,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Signal shutdown, wait for both tasks, abort whichever overstays
    async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        info!(client_id = %self.client_id, "Sent shutdown signal to session supervisor");

        for (name, mut handle) in [("supervisor", self.supervisor), ("dispatcher", self.dispatcher)] {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Session task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(task = name, error = %e, "Session task ended with error");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "Session task didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }
    }
}

/// Owns the broker session, the connection state and the telemetry log
///
/// At most one session is open at a time. The state and the telemetry feed
/// outlive sessions, so records survive a disconnect/connect cycle.
pub struct ConnectionManager<F: SessionFactory = MqttSessionFactory> {
    factory: F,
    topics: TopicsSection,
    schema: PayloadSchema,
    reconnect_config: ReconnectConfig,
    channel_capacity: usize,
    state: ConnectionStateCell,
    sink: TelemetrySink,
    feed: TelemetryFeed,
    stats: SharedStats,
    active: Mutex<Option<ActiveSession>>,
}

impl ConnectionManager<MqttSessionFactory> {
    /// Manager that provisions real mutual TLS sessions
    pub fn new(config: &MonitorConfig) -> Self {
        Self::with_factory(MqttSessionFactory::new(config), config)
    }
}

impl<F: SessionFactory> ConnectionManager<F> {
    pub fn with_factory(factory: F, config: &MonitorConfig) -> Self {
        let (sink, feed) = telemetry_channel();
        Self {
            factory,
            topics: config.topics.clone(),
            schema: config.schema.clone(),
            reconnect_config: config.reconnect.to_reconnect_config(),
            channel_capacity: config.session.channel_capacity,
            state: ConnectionStateCell::new(),
            sink,
            feed,
            stats: SharedStats::default(),
            active: Mutex::new(None),
        }
    }

    /// Open a session unless one is already running
    ///
    /// Returns as soon as the background tasks are spawned; progress shows up
    /// as state transitions. Only credential problems are reported here, and
    /// they leave the state at `Disconnected`.
    pub async fn connect(&self) -> Result<(), CredentialError> {
        let mut active = self.active.lock().await;

        if let Some(existing) = active.take() {
            if existing.is_running() && self.state.current() != ConnectionState::Disconnected {
                debug!(client_id = %existing.client_id, "Session already active, ignoring connect");
                *active = Some(existing);
                return Ok(());
            }
            // Retries ran out; reap the old tasks before starting over
            existing.shutdown(SHUTDOWN_GRACE).await;
        }

        let session = self.factory.open()?;
        let client_id = session.client_id().to_string();
        self.state.apply(ConnectionEvent::ConnectRequested);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);
        let generation = ConnectionGeneration::default();

        let router = TopicRouter::new(
            self.topics.clone(),
            PayloadDecoder::new(self.schema.clone()),
            self.sink.clone(),
            Arc::new(self.state.clone()),
        );
        let dispatcher = tokio::spawn(
            run_dispatcher(router, inbound_rx, generation.clone())
                .instrument(mqtt_span!(client_id = %client_id)),
        );

        let supervisor = Supervisor {
            session,
            state: self.state.clone(),
            stats: self.stats.clone(),
            reconnect_config: self.reconnect_config.clone(),
            subscriptions: build_subscriptions(&self.topics),
            inbound_tx,
            generation,
            shutdown_rx,
            reconnect_attempts: 0,
            acknowledged_once: false,
        };
        let supervisor =
            tokio::spawn(supervisor.run().instrument(mqtt_span!(client_id = %client_id)));

        *active = Some(ActiveSession {
            client_id,
            shutdown_tx,
            supervisor,
            dispatcher,
        });
        Ok(())
    }

    /// Close the session, even mid-reconnect, and move to `Disconnected`
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            session.shutdown(SHUTDOWN_GRACE).await;
        }
        self.stats.update(|s| s.connect_time = None);
        self.state.apply(ConnectionEvent::Stopped);
        info!("Connection manager stopped");
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn observe_state(&self) -> StateObserver {
        self.state.observer()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.state.subscribe_transitions()
    }

    pub fn telemetry(&self) -> TelemetryFeed {
        self.feed.clone()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        self.stats.metrics()
    }

    pub async fn is_session_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveSession::is_running)
    }
}

impl<F: SessionFactory> Drop for ConnectionManager<F> {
    fn drop(&mut self) {
        // Can't await here; callers wanting a clean DISCONNECT call disconnect() first
        if let Some(session) = self.active.get_mut().take() {
            let _ = session.shutdown_tx.send(true);
            session.supervisor.abort();
            session.dispatcher.abort();
        }
    }
}

/// Run the topic router over inbound publishes until the supervisor exits
async fn run_dispatcher(
    router: TopicRouter,
    mut inbound_rx: mpsc::Receiver<Dispatch>,
    generation: ConnectionGeneration,
) {
    while let Some(Dispatch {
        generation: arrived_on,
        message,
    }) = inbound_rx.recv().await
    {
        if arrived_on == generation.current() {
            router.on_message(&message.topic, &message.payload);
        } else {
            router.on_stale_message(&message.topic, &message.payload);
        }
    }
    debug!("Dispatcher stopped");
}

/// Backoff sleep that ends early on shutdown; false means stop retrying
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown requested during backoff");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

struct Supervisor<S> {
    session: S,
    state: ConnectionStateCell,
    stats: SharedStats,
    reconnect_config: ReconnectConfig,
    subscriptions: Vec<Subscription>,
    inbound_tx: mpsc::Sender<Dispatch>,
    generation: ConnectionGeneration,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_attempts: u32,
    acknowledged_once: bool,
}

impl<S: BrokerSession> Supervisor<S> {
    async fn run(mut self) {
        info!("Starting MQTT session supervisor");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping session supervisor");
                        break;
                    }
                }

                event = self.session.next_event() => {
                    let keep_running = match event {
                        Ok(route) => self.process_event_route(route).await,
                        Err(error) => self.handle_transport_error(error).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Session did not close cleanly");
        }
        info!("MQTT session supervisor stopped");
    }

    /// False stops the supervisor
    async fn process_event_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                info!(session_present, "Broker accepted MQTT session");
                self.reconnect_attempts = 0;
                self.stats.update(|s| s.connect_time = Some(Instant::now()));
                self.acknowledged_once = true;

                if !session_present {
                    self.subscribe().await;
                }
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(topic = %message.topic, size = message.payload.len(), "Received MQTT message");
                self.stats.update(|s| s.last_message_time = Some(Instant::now()));
                let dispatch = Dispatch {
                    generation: self.generation.current(),
                    message,
                };
                if self.inbound_tx.send(dispatch).await.is_err() {
                    error!("Dispatcher is gone, stopping session supervisor");
                    return false;
                }
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                match MessageHandler::validate_subscription_success(&self.subscriptions, &granted)
                {
                    Ok(()) => debug!(packet_id, ?granted, "Subscription confirmed"),
                    Err(e) => error!(packet_id, error = %e, "Subscription failed"),
                }
                true
            }
            EventRoute::Disconnected => {
                warn!("Broker sent DISCONNECT");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::DisconnectSent | EventRoute::OutgoingEvent => true,
        }
    }

    async fn subscribe(&mut self) {
        match self.session.subscribe(&self.subscriptions).await {
            Ok(()) => {
                for subscription in &self.subscriptions {
                    debug!(topic = %subscription.topic, qos = ?subscription.qos, "Subscribing");
                }
            }
            Err(e) => error!(error = %e, "Failed to queue subscriptions"),
        }
    }

    /// Record the failure, then back off. Returns false when the supervisor should stop.
    async fn handle_transport_error(&mut self, error: TransportError) -> bool {
        let generation = self.generation.advance();
        error!(error = %error, generation, "MQTT transport error");
        self.stats.update(|s| s.connect_time = None);
        self.state
            .apply(ConnectionEvent::TransportFailed(error.to_string()));

        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                match self.reconnect_config.max_attempts {
                    Some(max) => info!(attempt, max, delay_ms, "Scheduling reconnect"),
                    None => info!(attempt, delay_ms, "Scheduling reconnect"),
                }

                if !interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                if self.acknowledged_once {
                    self.stats.update(|s| s.reconnect_count += 1);
                }
                self.state
                    .apply(ConnectionEvent::ReconnectScheduled(attempt));
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.state.apply(ConnectionEvent::RetriesExhausted(reason));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn router_for(state: &ConnectionStateCell) -> (TopicRouter, TelemetryFeed) {
        let (sink, feed) = telemetry_channel();
        let router = TopicRouter::new(
            TopicsSection::default(),
            PayloadDecoder::new(PayloadSchema::detections()),
            sink,
            Arc::new(state.clone()),
        );
        (router, feed)
    }

    fn dispatch(generation: u64, topic: &str, payload: &str) -> Dispatch {
        Dispatch {
            generation,
            message: InboundMessage {
                topic: topic.to_string(),
                payload: Bytes::from(payload.to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_status_queued_before_transport_loss_is_dropped() {
        let state = ConnectionStateCell::new();
        state.apply(ConnectionEvent::ConnectRequested);
        let (router, feed) = router_for(&state);
        let generation = ConnectionGeneration::default();
        let (tx, rx) = mpsc::channel(8);

        // Both arrived before the link dropped but are dispatched after it
        tx.send(dispatch(0, "esp32cam/status", "connected"))
            .await
            .unwrap();
        tx.send(dispatch(
            0,
            "esp32cam/processed",
            r#"{"objects": [{"label": "cup", "distance": 0.5, "risk_level": "low"}]}"#,
        ))
        .await
        .unwrap();
        assert_eq!(generation.advance(), 1);
        tx.send(dispatch(1, "esp32cam/status", "rebooting"))
            .await
            .unwrap();
        drop(tx);

        run_dispatcher(router, rx, generation).await;

        assert_eq!(state.current(), ConnectionState::Connecting);
        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn test_status_on_current_generation_connects() {
        let state = ConnectionStateCell::new();
        state.apply(ConnectionEvent::ConnectRequested);
        let (router, _feed) = router_for(&state);
        let generation = ConnectionGeneration::default();
        generation.advance();
        let (tx, rx) = mpsc::channel(8);

        tx.send(dispatch(1, "esp32cam/status", "connected"))
            .await
            .unwrap();
        drop(tx);

        run_dispatcher(router, rx, generation).await;
        assert_eq!(state.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        let started = Instant::now();
        assert!(!interruptible_sleep(shutdown_rx, 10_000).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        assert!(!interruptible_sleep(shutdown_rx, 10_000).await);
    }

    #[test]
    fn test_health_metrics_before_connect() {
        let stats = SharedStats::default();
        let metrics = stats.metrics();
        assert!(metrics.uptime.is_none());
        assert_eq!(metrics.reconnect_count, 0);
        assert!(!metrics.is_healthy);

        stats.update(|s| s.connect_time = Some(Instant::now()));
        assert!(stats.metrics().is_healthy);
    }
}
