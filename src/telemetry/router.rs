//! Routes inbound publishes by exact topic match

use super::decoder::{DecodeError, PayloadDecoder};
use super::sink::TelemetrySink;
use crate::config::TopicsSection;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives the device-online signal from the status topic
pub trait LivenessSignal: Send + Sync {
    /// Returns true if this call changed the connection state
    fn device_online(&self) -> bool;
}

/// What happened to one inbound message
#[derive(Debug)]
pub enum RouteOutcome {
    /// The status token matched; `changed` is false when the device was already online
    StatusAccepted { changed: bool },
    StatusIgnored,
    /// Status published before the current connection was established
    StatusStale,
    Appended(usize),
    Discarded(DecodeError),
    UnknownTopic,
}

pub struct TopicRouter {
    topics: TopicsSection,
    decoder: PayloadDecoder,
    sink: TelemetrySink,
    liveness: Arc<dyn LivenessSignal>,
}

impl TopicRouter {
    pub fn new(
        topics: TopicsSection,
        decoder: PayloadDecoder,
        sink: TelemetrySink,
        liveness: Arc<dyn LivenessSignal>,
    ) -> Self {
        Self {
            topics,
            decoder,
            sink,
            liveness,
        }
    }

    /// Handle one message. Never fails: bad payloads are logged and dropped.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        if topic == self.topics.status {
            self.on_status(payload)
        } else if topic == self.topics.data {
            self.on_data(topic, payload)
        } else {
            debug!(topic = %topic, "Ignoring message on unsubscribed topic");
            RouteOutcome::UnknownTopic
        }
    }

    /// Handle a message received on an earlier connection
    ///
    /// Data still lands in the log. Status says nothing about the current
    /// connection and is dropped.
    pub fn on_stale_message(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        if topic == self.topics.status {
            debug!(size = payload.len(), "Dropping status from a previous connection");
            RouteOutcome::StatusStale
        } else {
            self.on_message(topic, payload)
        }
    }

    fn on_status(&self, payload: &[u8]) -> RouteOutcome {
        let token = String::from_utf8_lossy(payload);
        if token.trim() != self.topics.status_token {
            debug!(status = %token.trim(), "Status message without the online token");
            return RouteOutcome::StatusIgnored;
        }

        let changed = self.liveness.device_online();
        if changed {
            info!("Device reported online");
        } else {
            debug!("Repeated online token");
        }
        RouteOutcome::StatusAccepted { changed }
    }

    fn on_data(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        match self.decoder.decode(payload) {
            Ok(records) => {
                let count = self.sink.extend(records);
                debug!(topic = %topic, count, "Appended telemetry records");
                RouteOutcome::Appended(count)
            }
            Err(error) => {
                warn!(
                    topic = %topic,
                    payload_size = payload.len(),
                    error = %error,
                    "Discarding malformed telemetry payload"
                );
                RouteOutcome::Discarded(error)
            }
        }
    }
}
