//! Inbound PUBLISH handling
//!
//! Applies the per-QoS receive rules and hands accepted messages to the
//! routing hub. QoS 2 messages are routed on first receipt; the packet
//! id stays in the dedup window until the client releases it.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::hooks::{contain_panic, ClientInfo};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(
        &mut self,
        client: &ClientInfo,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client.client_id,
            publish.topic,
            publish.qos
        );

        // A denied message is dropped without routing; protocol
        // acknowledgements still flow so the client's state stays sane
        let accepted = contain_panic(
            "on_msg_arrived",
            false,
            self.hooks.on_msg_arrived(client, &publish),
        )
        .await;
        if !accepted {
            debug!(
                "PUBLISH from {} to {} dropped by hook",
                client.client_id, publish.topic
            );
        }

        match publish.qos {
            QoS::AtMostOnce => {
                if accepted {
                    self.router.publish(&publish);
                }
            }
            QoS::AtLeastOnce => {
                let packet_id = require_packet_id(&publish)?;
                if accepted {
                    self.router.publish(&publish);
                }
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id)))
                    .await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = require_packet_id(&publish)?;
                // Route only on first receipt; a re-sent PUBLISH with the
                // same id before PUBREL just gets another PUBREC
                let first_receipt = {
                    let mut s = session.write();
                    s.inbound_qos2.insert(packet_id)
                };
                if first_receipt && accepted {
                    self.router.publish(&publish);
                }
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                    .await?;
            }
        }

        Ok(())
    }
}

fn require_packet_id(publish: &Publish) -> Result<u16, ConnectionError> {
    publish.packet_id.ok_or(ConnectionError::Protocol(
        ProtocolError::ProtocolViolation("QoS > 0 PUBLISH without packet id"),
    ))
}
