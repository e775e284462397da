//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)
//!
//! State transitions for the outbound in-flight table and the inbound
//! QoS 2 dedup window. Freed in-flight slots pull queued messages in.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, ProtocolError, PubComp, PubRel};
use crate::session::{InflightState, Session};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK ends a QoS 1 delivery. Acking an id that is not awaiting
    /// PUBACK is a protocol violation.
    pub(crate) async fn handle_puback(
        &mut self,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            let awaiting = matches!(
                s.in_flight.get(&packet_id),
                Some(m) if m.state == InflightState::AwaitingPuback
            );
            if !awaiting {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "PUBACK for unknown packet id",
                )));
            }
            s.in_flight.remove(&packet_id);
        }
        self.drain_pending(session).await
    }

    /// PUBREC moves a QoS 2 delivery to the release phase
    pub(crate) async fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            match s.in_flight.get_mut(&packet_id) {
                Some(m) if m.state == InflightState::AwaitingPubrec => {
                    m.state = InflightState::AwaitingPubcomp;
                }
                // A duplicate PUBREC after our PUBREL: answer it again
                Some(m) if m.state == InflightState::AwaitingPubcomp => {}
                _ => {
                    return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "PUBREC for unknown packet id",
                    )))
                }
            }
        }
        self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
            .await
    }

    /// PUBREL clears the inbound dedup entry and always answers PUBCOMP
    pub(crate) async fn handle_pubrel(
        &mut self,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            s.inbound_qos2.remove(&packet_id);
        }
        self.write_packet(&Packet::PubComp(PubComp::new(packet_id)))
            .await
    }

    /// PUBCOMP ends a QoS 2 delivery
    pub(crate) async fn handle_pubcomp(
        &mut self,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            let released = matches!(
                s.in_flight.get(&packet_id),
                Some(m) if m.state == InflightState::AwaitingPubcomp
            );
            if released {
                s.in_flight.remove(&packet_id);
            }
        }
        self.drain_pending(session).await
    }
}
