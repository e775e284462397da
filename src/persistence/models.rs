//! Serializable session snapshots

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::{Publish, QoS};
use crate::session::{InflightState, Session};

/// A message in storable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl StoredMessage {
    fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
        }
    }

    fn to_publish(&self, packet_id: Option<u16>) -> Publish {
        Publish {
            dup: false,
            qos: QoS::from_u8(self.qos).unwrap_or(QoS::AtMostOnce),
            retain: self.retain,
            topic: self.topic.as_str().into(),
            packet_id,
            payload: Bytes::from(self.payload.clone()),
        }
    }
}

/// In-flight delivery state in storable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInflight {
    pub packet_id: u16,
    /// 1 = awaiting PUBACK, 2 = awaiting PUBREC, 3 = awaiting PUBCOMP
    pub state: u8,
    pub message: StoredMessage,
}

/// One subscription in storable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
}

/// Everything the broker needs to rebuild a persistent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub subscriptions: Vec<StoredSubscription>,
    pub pending: Vec<StoredMessage>,
    pub in_flight: Vec<StoredInflight>,
}

impl SessionSnapshot {
    pub fn from_session(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, qos)| StoredSubscription {
                    filter: filter.clone(),
                    qos: *qos as u8,
                })
                .collect(),
            pending: session
                .pending_iter()
                .map(StoredMessage::from_publish)
                .collect(),
            in_flight: session
                .in_flight
                .iter()
                .map(|(packet_id, m)| StoredInflight {
                    packet_id: *packet_id,
                    state: match m.state {
                        InflightState::AwaitingPuback => 1,
                        InflightState::AwaitingPubrec => 2,
                        InflightState::AwaitingPubcomp => 3,
                    },
                    message: StoredMessage::from_publish(&m.publish),
                })
                .collect(),
        }
    }

    /// Fill a freshly created session from this snapshot
    pub fn restore_into(&self, session: &mut Session) {
        for sub in &self.subscriptions {
            session.add_subscription(
                sub.filter.clone(),
                QoS::from_u8(sub.qos).unwrap_or(QoS::AtMostOnce),
            );
        }

        for message in &self.pending {
            session.queue_message(message.to_publish(None));
        }

        for inflight in &self.in_flight {
            let publish = inflight.message.to_publish(Some(inflight.packet_id));
            session.insert_in_flight(inflight.packet_id, publish);
            if inflight.state == 3 {
                if let Some(m) = session.in_flight.get_mut(&inflight.packet_id) {
                    m.state = InflightState::AwaitingPubcomp;
                }
            }
        }
    }
}
