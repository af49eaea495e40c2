//! Event and command vocabulary exchanged with the transport/codec
//!
//! The engine never touches bytes on the wire. The codec hands it decoded
//! [`InboundEvent`]s in arrival order and encodes the [`OutboundCommand`]s the
//! engine emits, also in order.
//!
//! ```text
//! codec ──[InboundEvent]──► reader ──► in-flight / registry / dispatcher
//! codec ◄─[OutboundCommand]── writer ◄── facade / reader / timers
//! ```

use chrono::{DateTime, Local};
pub use rumqttc::QoS;
use std::fmt;
use std::time::Duration;

/// Numeric level of a [`QoS`]
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// The lower of two QoS levels
pub fn min_qos(a: QoS, b: QoS) -> QoS {
    if qos_level(a) <= qos_level(b) {
        a
    } else {
        b
    }
}

/// A publish as handed to the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPublish {
    /// Present for QoS 1 and 2
    pub packet_id: Option<u16>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
}

/// A publish as decoded by the codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub packet_id: Option<u16>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub duplicate: bool,
}

impl InboundPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            packet_id: None,
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            duplicate: false,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }
}

/// Decoded events read from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Broker answered the connect handshake; `return_code` 0 means accepted
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    /// Subscribe acknowledgment; `granted` is `None` when refused
    SubAck {
        packet_id: u16,
        granted: Option<QoS>,
    },
    UnsubAck {
        packet_id: u16,
    },
    Publish(InboundPublish),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    PingResp,
    /// Broker closed the session from its side
    Disconnect {
        reason: String,
    },
}

/// Commands written to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    Connect {
        client_id: String,
        clean_session: bool,
        keep_alive: Duration,
    },
    Subscribe {
        packet_id: u16,
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        packet_id: u16,
        filter: String,
    },
    Publish(OutgoingPublish),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    PingReq,
    Disconnect,
}

impl OutboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::Connect { .. } => "CONNECT",
            OutboundCommand::Subscribe { .. } => "SUBSCRIBE",
            OutboundCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            OutboundCommand::Publish(_) => "PUBLISH",
            OutboundCommand::PubAck { .. } => "PUBACK",
            OutboundCommand::PubRec { .. } => "PUBREC",
            OutboundCommand::PubRel { .. } => "PUBREL",
            OutboundCommand::PubComp { .. } => "PUBCOMP",
            OutboundCommand::PingReq => "PINGREQ",
            OutboundCommand::Disconnect => "DISCONNECT",
        }
    }
}

/// An inbound message as seen by handlers. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    duplicate: bool,
    received_at: DateTime<Local>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            duplicate: false,
            received_at: Local::now(),
        }
    }

    pub fn from_publish(publish: InboundPublish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            duplicate: publish.duplicate,
            received_at: Local::now(),
        }
    }

    /// Copy of this message carrying the QoS one subscription receives it at
    pub(crate) fn at_qos(&self, qos: QoS) -> Self {
        Self {
            qos,
            ..self.clone()
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("duplicate", &self.duplicate)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.payload).chars().take(10).collect();
        write!(
            f,
            "{}: {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_level(QoS::ExactlyOnce), 2);
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(3), None);
        assert_eq!(min_qos(QoS::ExactlyOnce, QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(min_qos(QoS::AtMostOnce, QoS::ExactlyOnce), QoS::AtMostOnce);
    }

    #[test]
    fn message_from_publish_keeps_flags() {
        let publish = InboundPublish::new("a/b", b"hello world".to_vec(), QoS::AtLeastOnce)
            .with_packet_id(7)
            .with_retain(true)
            .with_duplicate(true);
        let message = Message::from_publish(publish);

        assert_eq!(message.topic(), "a/b");
        assert_eq!(message.payload_str(), Some("hello world"));
        assert!(message.retain());
        assert!(message.duplicate());
        assert_eq!(message.at_qos(QoS::AtMostOnce).qos(), QoS::AtMostOnce);
        assert!(message.to_string().ends_with("a/b - hello worl"));
    }
}
