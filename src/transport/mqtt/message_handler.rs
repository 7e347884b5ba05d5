//! Pure routing of broker event-loop events
//!
//! Every event polled from the broker is mapped to an [`EventRoute`] here so
//! the impure event loop only has to act on a closed set of cases.

use super::connection::from_mqtt_qos;
use crate::protocol::MessageEnvelope;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Routing decision for one broker event
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// ConnAck received; the session is usable
    ConnectionAcknowledged,
    /// Inbound publish on a subscribed topic
    MessageReceived { envelope: MessageEnvelope, retain: bool },
    /// Broker closed the session
    Disconnected { reason: String },
    /// SubAck with its reason codes rendered for logging
    SubscriptionConfirmed { packet_id: u16, codes: Vec<String> },
    /// Pings and other protocol housekeeping
    InfrastructureEvent(String),
    /// Outgoing packets, handled by the client library
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => {
                    let topic = String::from_utf8_lossy(&publish.topic).to_string();
                    EventRoute::MessageReceived {
                        envelope: MessageEnvelope::new(
                            topic,
                            publish.payload.clone(),
                            from_mqtt_qos(publish.qos),
                        ),
                        retain: publish.retain,
                    }
                }
                Packet::Disconnect(disconnect) => EventRoute::Disconnected {
                    reason: format!("{:?}", disconnect.reason_code),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    codes: suback
                        .return_codes
                        .iter()
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// True when any SubAck reason code signals a refused subscription
    pub fn subscription_refused(codes: &[String]) -> bool {
        codes.iter().any(|code| {
            let lowered = code.to_lowercase();
            !(lowered.starts_with("success") || lowered.starts_with("qos"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QosLevel;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_publish_preserves_topic_payload_and_qos() {
        let event = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("scale/weight"),
            pkid: 1,
            payload: Bytes::from("15.5"),
            properties: None,
        }));

        match MessageHandler::route_event(&event) {
            EventRoute::MessageReceived { envelope, retain } => {
                assert_eq!(envelope.topic, "scale/weight");
                assert_eq!(envelope.payload.as_ref(), b"15.5");
                assert_eq!(envelope.qos, QosLevel::AtLeastOnce);
                assert!(!retain);
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_connack_and_disconnect() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        match MessageHandler::route_event(&disconnect) {
            EventRoute::Disconnected { reason } => assert_eq!(reason, "NormalDisconnection"),
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_subscription_refused() {
        assert!(!MessageHandler::subscription_refused(&[
            "Success(AtLeastOnce)".to_string()
        ]));
        assert!(!MessageHandler::subscription_refused(&["QoS1".to_string()]));
        assert!(MessageHandler::subscription_refused(&[
            "Success(AtMostOnce)".to_string(),
            "NotAuthorized".to_string()
        ]));
    }
}
