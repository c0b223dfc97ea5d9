//! Pure routing of rumqttc events
//!
//! Turns raw v5 events into the small set of decisions the session event loop
//! acts on. Nothing here performs I/O.

use super::connection::from_rumqttc_qos;
use crate::transport::{InboundMessage, SubscribeResultCode};
use chrono::Utc;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, PubCompReason, SubscribeReasonCode,
};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;

/// Pure routing decisions based on MQTT events
pub struct EventRouter;

impl EventRouter {
    /// Route MQTT event to the matching session action
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if matches!(ack.code, ConnectReturnCode::Success) => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::ConnAck(ack) => EventRoute::ConnectionRefused {
                    reason: format!("{:?}", ack.code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: from_rumqttc_qos(publish.qos),
                    retain: publish.retain,
                    received_at: Utc::now(),
                }),
                Packet::Disconnect(disconnect) => EventRoute::Disconnected {
                    reason: format!("broker sent disconnect: {:?}", disconnect.reason_code),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    codes: suback
                        .return_codes
                        .iter()
                        .map(Self::map_subscribe_reason)
                        .collect(),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                    rejection: match puback.reason {
                        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => None,
                        other => Some(format!("{other:?}")),
                    },
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                    packet_id: pubcomp.pkid,
                    rejection: match pubcomp.reason {
                        PubCompReason::Success => None,
                        other => Some(format!("{other:?}")),
                    },
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::PublishSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Map one SubAck reason code
    pub fn map_subscribe_reason(code: &SubscribeReasonCode) -> SubscribeResultCode {
        match code {
            SubscribeReasonCode::Success(qos) => SubscribeResultCode::Granted(from_rumqttc_qos(*qos)),
            other => SubscribeResultCode::Rejected(format!("{other:?}")),
        }
    }

    /// Decide whether an event loop error is a broker refusal (credentials,
    /// client id, protocol) or a transient network failure
    pub fn is_refusal(error: &ConnectionError) -> bool {
        matches!(error, ConnectionError::ConnectionRefused(_))
    }

    /// Broker verdict carried by an event loop error that ended an outstanding
    /// publish, if any
    ///
    /// rumqttc fails `poll()` on a negative PubAck, PubRec or PubComp instead
    /// of yielding the packet.
    pub fn publish_rejection(error: &ConnectionError) -> Option<String> {
        match error {
            ConnectionError::MqttState(
                state @ (StateError::PubAckFail { .. }
                | StateError::PubRecFail { .. }
                | StateError::PubCompFail { .. }),
            ) => Some(state.to_string()),
            _ => None,
        }
    }

    /// Pair SubAck codes with the patterns of the request they answer
    ///
    /// A short SubAck leaves the trailing patterns rejected.
    pub fn pair_with_patterns(
        patterns: &[String],
        codes: Vec<SubscribeResultCode>,
    ) -> Vec<crate::transport::SubscribeOutcome> {
        let mut codes = codes.into_iter();
        patterns
            .iter()
            .map(|pattern| crate::transport::SubscribeOutcome {
                pattern: pattern.clone(),
                code: codes.next().unwrap_or_else(|| {
                    SubscribeResultCode::Rejected("missing reason code in SubAck".to_string())
                }),
            })
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// ConnAck carried a failure code
    ConnectionRefused { reason: String },
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected { reason: String },
    /// SubAck for an outstanding subscribe
    SubscriptionAcknowledged {
        packet_id: u16,
        codes: Vec<SubscribeResultCode>,
    },
    /// One of our publishes was written out; QoS 0 publishes carry packet id 0
    PublishSent { packet_id: u16 },
    /// Final acknowledgement (PubAck for QoS 1, PubComp for QoS 2)
    PublishAcknowledged {
        packet_id: u16,
        rejection: Option<String>,
    },
    /// Pings, acks and other protocol traffic
    InfrastructureEvent(String),
    /// Anything we sent
    OutgoingEvent,
}
