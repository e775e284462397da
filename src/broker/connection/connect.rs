//! CONNECT handshake
//!
//! First-packet validation, session takeover, the clean/persistent
//! session decision table and resume of in-flight traffic.

use std::sync::Arc;
use std::time::Instant;

use bytes::Buf;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError, State};
use crate::broker::generate_client_id;
use crate::broker::router::{CloseReason, ConnectionHandle};
use crate::hooks::{contain_panic, ClientInfo, SessionTerminatedReason};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, PubRel, Publish,
};
use crate::session::{InflightState, Session};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the first packet, which must be CONNECT
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("first packet from {} was not CONNECT", self.addr);
                            Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                                "first packet must be CONNECT",
                            )))
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolLevel(level)) => {
                    // [MQTT-3.1.2-2] tell the client before closing
                    let _ = self
                        .write_packet(&Packet::ConnAck(ConnAck::refused(
                            ConnectReturnCode::UnacceptableProtocolVersion,
                        )))
                        .await;
                    return Err(DecodeError::InvalidProtocolLevel(level).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::PeerClosed);
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // [MQTT-3.1.3-8] a zero-byte client id demands a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "rejecting empty client id with clean_session=0 from {}",
                self.addr
            );
            return self
                .refuse_connect(ConnectReturnCode::IdentifierRejected)
                .await;
        }

        let assigned_id = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned_id {
            generate_client_id().into()
        } else {
            connect.client_id.as_str().into()
        };

        let keep_alive = connect.keep_alive.min(self.router.config.max_keep_alive);

        let client = ClientInfo {
            client_id: client_id.clone(),
            addr: self.addr,
            username: connect.username.clone(),
            clean_session: connect.clean_session,
            keep_alive,
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        let code = contain_panic(
            "on_connect",
            ConnectReturnCode::NotAuthorized,
            self.hooks.on_connect(&client),
        )
        .await;
        if !code.is_accepted() {
            debug!("CONNECT from {} refused by hook: {:?}", client_id, code);
            return self.refuse_connect(code).await;
        }

        // Displace any live connection with the same client id and wait
        // for it to detach before touching its session
        self.takeover_existing(&client_id).await;

        let limits = self.router.config.session_limits();
        let existing = self.router.sessions.get(&client_id);
        let (session, session_present) = match existing {
            Some(old) => {
                if connect.clean_session {
                    // Discard the inherited session and start fresh
                    self.router.sessions.remove(&client_id);
                    self.router.subscriptions.remove_client(&client_id);
                    if let Err(e) = self.persistence.delete_session(&client_id).await {
                        warn!("failed to delete persisted session {}: {}", client_id, e);
                    }
                    contain_panic(
                        "on_session_terminated",
                        (),
                        self.hooks
                            .on_session_terminated(&client, SessionTerminatedReason::Takeover),
                    )
                    .await;
                    drop(old);
                    let session = Session::new(client_id.clone(), true, limits);
                    (Arc::new(RwLock::new(session)), false)
                } else {
                    (old, true)
                }
            }
            None => {
                let session = Session::new(client_id.clone(), connect.clean_session, limits);
                (Arc::new(RwLock::new(session)), false)
            }
        };

        // Register the channel before marking the session online so the
        // router never sees an attached session without one
        self.router.connections.insert(
            client_id.clone(),
            ConnectionHandle {
                tx: self.outbound_tx.clone(),
                close: self.close_signal.clone(),
                generation: self.generation,
            },
        );

        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive = keep_alive;
            s.assigned_id = assigned_id;
            s.will = connect.will.clone();
            s.attach(self.generation);
        }
        self.router.sessions.insert(session.clone());

        self.state = State::Connected {
            client: client.clone(),
            session: session.clone(),
        };

        self.write_packet(&Packet::ConnAck(ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await?;

        contain_panic("on_connected", (), self.hooks.on_connected(&client)).await;
        if session_present {
            contain_panic(
                "on_session_resumed",
                (),
                self.hooks.on_session_resumed(&client),
            )
            .await;
            self.resend_in_flight(&session).await?;
        } else {
            contain_panic(
                "on_session_created",
                (),
                self.hooks.on_session_created(&client),
            )
            .await;
        }

        self.drain_pending(&session).await?;

        Ok(())
    }

    /// Send a refusal CONNACK and abort the handshake
    async fn refuse_connect(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::refused(code)))
            .await?;
        Err(ConnectionError::Rejected(code))
    }

    /// Signal the current holder of this client id to close and wait for
    /// its detach
    async fn takeover_existing(&mut self, client_id: &Arc<str>) {
        let mut attempts = 0;
        while let Some((tx, close)) = self
            .router
            .connections
            .get(client_id)
            .map(|h| (h.tx.clone(), h.close.clone()))
        {
            debug!("taking over session {} from a live connection", client_id);
            close.close(CloseReason::Takeover);
            attempts += 1;

            let grace = self.router.config.shutdown_grace;
            if timeout(grace, tx.closed()).await.is_err() || attempts >= 3 {
                // The old connection is wedged; drop its registration so
                // the new one can proceed
                warn!("forcing deregistration of stale connection {}", client_id);
                self.router
                    .connections
                    .remove_if(client_id, |_, h| h.generation != self.generation);
                return;
            }
        }
    }

    /// Re-emit unacknowledged in-flight messages in packet-id order.
    ///
    /// [MQTT-4.4.0-1] PUBLISHes awaiting PUBACK or PUBREC go out again
    /// with DUP=1; releases awaiting PUBCOMP re-send PUBREL.
    async fn resend_in_flight(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let to_resend: Vec<(u16, InflightState, Publish)> = {
            let mut s = session.write();
            let now = Instant::now();
            s.in_flight
                .iter_mut()
                .map(|(packet_id, inflight)| {
                    inflight.sent_at = now;
                    inflight.retry_count += 1;
                    (*packet_id, inflight.state, inflight.publish.clone())
                })
                .collect()
        };

        for (packet_id, state, mut publish) in to_resend {
            match state {
                InflightState::AwaitingPuback | InflightState::AwaitingPubrec => {
                    publish.dup = true;
                    publish.packet_id = Some(packet_id);
                    trace!("resending PUBLISH packet_id={} with DUP=1", packet_id);
                    self.write_packet(&Packet::Publish(publish)).await?;
                }
                InflightState::AwaitingPubcomp => {
                    trace!("resending PUBREL packet_id={}", packet_id);
                    self.write_packet(&Packet::PubRel(PubRel::new(packet_id)))
                        .await?;
                }
            }
        }

        Ok(())
    }
}
