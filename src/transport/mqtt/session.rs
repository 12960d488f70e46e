//! rumqttc-backed broker session

use super::connection::{configure_mqtt_options, Subscription, TransportError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{MonitorConfig, SessionSection};
use crate::credentials::{CredentialError, ProvisionedSession, Provisioner};
use crate::transport::{BrokerSession, SessionFactory};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, SubscribeFilter};
use std::time::Duration;
use tracing::{debug, info};

/// Capacity of the rumqttc request queue
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `close` waits for DISCONNECT to be written
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Session over an `AsyncClient`/`EventLoop` pair
///
/// The event loop reconnects on the next poll after an error, keeping the
/// client id so the broker can resume the persistent session.
pub struct MqttSession {
    client: AsyncClient,
    event_loop: EventLoop,
    client_id: String,
    connected: bool,
}

impl MqttSession {
    pub fn new(client: AsyncClient, event_loop: EventLoop, client_id: String) -> Self {
        Self {
            client,
            event_loop,
            client_id,
            connected: false,
        }
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn next_event(&mut self) -> Result<EventRoute, TransportError> {
        match self.event_loop.poll().await {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                if matches!(route, EventRoute::ConnectionAcknowledged { .. }) {
                    self.connected = true;
                }
                Ok(route)
            }
            Err(error) => {
                self.connected = false;
                Err(TransportError::Connection(error))
            }
        }
    }

    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        let filters = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), s.qos));
        self.client.subscribe_many(filters).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            debug!(client_id = %self.client_id, "Closing session without a live connection");
            return Ok(());
        }

        self.client.disconnect().await?;
        let event_loop = &mut self.event_loop;
        let drain = async {
            loop {
                match event_loop.poll().await {
                    Ok(event) => {
                        if MessageHandler::route_mqtt_event(&event) == EventRoute::DisconnectSent {
                            return Ok(());
                        }
                    }
                    Err(error) => return Err(TransportError::Connection(error)),
                }
            }
        };

        let result = match tokio::time::timeout(CLOSE_TIMEOUT, drain).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Other(
                "timed out sending DISCONNECT".to_string(),
            )),
        };
        self.connected = false;
        result
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Opens [`MqttSession`]s from the bundled credentials
#[derive(Debug, Clone)]
pub struct MqttSessionFactory {
    provisioner: Provisioner,
    session: SessionSection,
}

impl MqttSessionFactory {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            provisioner: Provisioner::new(&config.assets, &config.session),
            session: config.session.clone(),
        }
    }
}

impl SessionFactory for MqttSessionFactory {
    type Session = MqttSession;

    fn open(&self) -> Result<MqttSession, CredentialError> {
        let ProvisionedSession { broker, tls } = self.provisioner.provision()?;
        info!(
            endpoint = %broker.endpoint,
            port = broker.port,
            client_id = %broker.client_id,
            trust_anchors = tls.trust_anchor_count(),
            key_converted = tls.key_converted(),
            "Opening MQTT session"
        );

        let options = configure_mqtt_options(&broker, &tls, &self.session);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Ok(MqttSession::new(client, event_loop, broker.client_id))
    }
}
