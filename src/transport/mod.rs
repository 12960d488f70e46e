//! Transport layer between the monitor and the broker
//!
//! The connection manager drives a [`BrokerSession`] it obtains from a
//! [`SessionFactory`]. Production code uses the rumqttc implementation in
//! [`mqtt`]; tests plug in the scripted session from `crate::testing`.

use crate::credentials::CredentialError;
use async_trait::async_trait;

pub mod mqtt;

pub use mqtt::{EventRoute, Subscription, TransportError};

/// One live broker session
///
/// `next_event` drives the connection. An error means the transport failed;
/// the following call dials the broker again with the same session state.
#[async_trait]
pub trait BrokerSession: Send + 'static {
    /// Wait for the next routed event
    async fn next_event(&mut self) -> Result<EventRoute, TransportError>;

    /// Queue subscriptions; granted QoS arrives later as `SubscriptionConfirmed`
    async fn subscribe(&mut self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    /// Send DISCONNECT if connected and release the socket
    async fn close(&mut self) -> Result<(), TransportError>;

    fn client_id(&self) -> &str;
}

/// Opens sessions with freshly provisioned credentials
pub trait SessionFactory: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Provision credentials and prepare a session without touching the network
    fn open(&self) -> Result<Self::Session, CredentialError>;
}
