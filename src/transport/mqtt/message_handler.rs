//! Pure routing of rumqttc events
//!
//! The event loop yields every packet it sees; the supervisor only cares
//! about a handful of them, classified here without side effects.

use super::connection::{Subscription, TransportError};
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::debug;

/// Classifies event loop output for the supervisor
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the supervisor action it needs (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(outgoing) => {
                debug!(packet = ?outgoing, "Outgoing MQTT packet");
                EventRoute::OutgoingEvent
            }
        }
    }

    /// Every filter in a SUBACK must have been granted
    ///
    /// Return codes pair with `requested` by position; a missing code counts
    /// as a rejection.
    pub fn validate_subscription_success(
        requested: &[Subscription],
        granted: &[Option<QoS>],
    ) -> Result<(), TransportError> {
        let rejected: Vec<&str> = requested
            .iter()
            .enumerate()
            .filter(|(index, _)| !matches!(granted.get(*index), Some(Some(_))))
            .map(|(_, subscription)| subscription.topic.as_str())
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(TransportError::SubscriptionRejected(rejected.join(", ")))
        }
    }
}

/// One publish handed from the network task to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// What the supervisor should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged { session_present: bool },
    /// PUBLISH on one of our filters
    MessageReceived(InboundMessage),
    /// Granted QoS per filter; None marks a rejected filter
    SubscriptionConfirmed {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// Broker-initiated DISCONNECT
    Disconnected,
    /// Our DISCONNECT left the socket
    DisconnectSent,
    /// Keep-alive and acknowledgement traffic, kept only for logging
    InfrastructureEvent(String),
    /// Anything we sent
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged {
                session_present: false
            }
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("esp32cam/status", QoS::AtLeastOnce, "connected");
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "esp32cam/status");
                assert_eq!(&message.payload[..], b"connected");
            }
            other => panic!("Expected MessageReceived, got {other:?}"),
        }
    }

    #[test]
    fn test_route_suback() {
        let suback = SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        let event = Event::Incoming(Packet::SubAck(suback));

        let route = MessageHandler::route_mqtt_event(&event);
        assert_eq!(
            route,
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                granted: vec![Some(QoS::AtLeastOnce), None],
            }
        );
    }

    #[test]
    fn test_route_infrastructure_and_outgoing() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
    }

    fn requested() -> Vec<Subscription> {
        crate::transport::mqtt::build_subscriptions(&crate::config::TopicsSection::default())
    }

    #[test]
    fn test_validate_subscription_success() {
        let requested = requested();
        assert!(MessageHandler::validate_subscription_success(
            &requested,
            &[Some(QoS::AtLeastOnce), Some(QoS::AtMostOnce)]
        )
        .is_ok());
        assert!(MessageHandler::validate_subscription_success(&[], &[]).is_ok());
    }

    #[test]
    fn test_rejected_filter_names_its_topic() {
        let requested = requested();
        let result =
            MessageHandler::validate_subscription_success(&requested, &[Some(QoS::AtLeastOnce), None]);

        match result {
            Err(TransportError::SubscriptionRejected(topic)) => {
                assert_eq!(topic, "esp32cam/processed");
            }
            other => panic!("Expected SubscriptionRejected, got {other:?}"),
        }
    }

    #[test]
    fn test_short_suback_rejects_unanswered_filters() {
        let requested = requested();
        let result = MessageHandler::validate_subscription_success(&requested, &[]);

        match result {
            Err(TransportError::SubscriptionRejected(topics)) => {
                assert_eq!(topics, "esp32cam/status, esp32cam/processed");
            }
            other => panic!("Expected SubscriptionRejected, got {other:?}"),
        }
    }
}
