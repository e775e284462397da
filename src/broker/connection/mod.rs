//! Connection state machine
//!
//! Drives one transport connection through its lifetime: the CONNECT
//! handshake, packet dispatch while connected, keepalive enforcement and
//! the close sequence. The connection task owns its session's mutable
//! state; other tasks reach it through the outbound channel or the close
//! signal.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::router::{next_generation, CloseReason, CloseSignal, Outbound, Router};
use crate::buffer_pool;
use crate::codec::{Decoder, Encoder};
use crate::hooks::{ClientInfo, Hooks};
use crate::persistence::SessionBackend;
use crate::protocol::{ConnectReturnCode, DecodeError, Packet, ProtocolError, Publish, QoS};
use crate::session::Session;

/// Connection error kinds
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// The first packet did not arrive within the connect timeout
    ConnectTimeout,
    /// No packet within 1.5x the negotiated keep alive
    KeepAliveTimeout,
    /// CONNECT refused with the given CONNACK code
    Rejected(ConnectReturnCode),
    /// The client closed the socket without DISCONNECT
    PeerClosed,
    /// A new CONNECT with the same client id displaced this connection
    TakenOver,
    /// Bounded queues overflowed beyond policy
    ResourceExhausted,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::ConnectTimeout => write!(f, "connect timeout"),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
            Self::Rejected(code) => write!(f, "connect rejected: {:?}", code),
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::TakenOver => write!(f, "session taken over"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

/// Connection lifecycle state
pub(crate) enum State {
    /// Waiting for the CONNECT packet
    Connecting,
    /// Handshake complete, dispatching packets
    Connected {
        client: ClientInfo,
        session: Arc<RwLock<Session>>,
    },
}

/// How the connected loop ended without an error
enum CloseMode {
    /// The client sent DISCONNECT
    Disconnect,
    /// The broker is shutting down
    Shutdown,
    /// A new CONNECT displaced this connection
    Takeover,
}

/// Whether packet dispatch continues the loop
pub(crate) enum Control {
    Continue,
    Disconnect,
}

/// Connection handler, generic over the byte stream (TCP or WebSocket)
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) router: Arc<Router>,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) persistence: Arc<dyn SessionBackend>,
    pub(crate) outbound_tx: mpsc::Sender<Outbound>,
    pub(crate) outbound_rx: mpsc::Receiver<Outbound>,
    pub(crate) close_signal: Arc<CloseSignal>,
    pub(crate) generation: u64,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        router: Arc<Router>,
        hooks: Arc<dyn Hooks>,
        persistence: Arc<dyn SessionBackend>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(router.config.outbound_capacity);
        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(router.config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: buffer_pool::get(),
            write_buf: buffer_pool::get(),
            router,
            hooks,
            persistence,
            outbound_tx,
            outbound_rx,
            close_signal: Arc::new(CloseSignal::new()),
            generation: next_generation(),
            shutdown_rx,
        }
    }

    /// Drive the connection to completion
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.router.config.connect_timeout;
        match tokio::time::timeout(connect_timeout, self.read_connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // A failure after the state transition (CONNACK write,
                // resume traffic) still owns registered state
                self.handle_close(Some(&e), false).await;
                return Err(e);
            }
            Err(_) => {
                debug!("connect timeout from {}", self.addr);
                return Err(ConnectionError::ConnectTimeout);
            }
        }

        let outcome = self.connected_loop().await;
        match outcome {
            Ok(CloseMode::Disconnect) | Ok(CloseMode::Shutdown) => {
                self.handle_close(None, false).await;
                Ok(())
            }
            Ok(CloseMode::Takeover) => {
                let err = ConnectionError::TakenOver;
                self.handle_close(Some(&err), true).await;
                Err(err)
            }
            Err(e) => {
                self.handle_close(Some(&e), false).await;
                Err(e)
            }
        }
    }

    /// The main packet loop after a successful handshake
    async fn connected_loop(&mut self) -> Result<CloseMode, ConnectionError> {
        let (client, session) = match &self.state {
            State::Connected { client, session } => (client.clone(), session.clone()),
            State::Connecting => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "not connected",
                )))
            }
        };

        let keep_alive = client.keep_alive;
        // [MQTT-3.1.2-24] disconnect after 1.5x the keep alive interval
        let keep_alive_window = std::time::Duration::from_millis(keep_alive as u64 * 1500);
        let close_signal = self.close_signal.clone();
        let mut deadline = tokio::time::Instant::now() + keep_alive_window;

        loop {
            tokio::select! {
                biased;

                reason = close_signal.requested() => {
                    return match reason {
                        CloseReason::Takeover => {
                            debug!("connection {} displaced by takeover", client.client_id);
                            Ok(CloseMode::Takeover)
                        }
                        CloseReason::ResourceExhausted => Err(ConnectionError::ResourceExhausted),
                    };
                }

                result = self.shutdown_rx.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => return Ok(CloseMode::Shutdown),
                    }
                }

                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => return Err(ConnectionError::PeerClosed),
                        Ok(_) => {
                            deadline = tokio::time::Instant::now() + keep_alive_window;
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                match self.handle_packet(&client, &session, packet).await? {
                                    Control::Continue => {}
                                    Control::Disconnect => return Ok(CloseMode::Disconnect),
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                Some(out) = self.outbound_rx.recv() => {
                    match out {
                        Outbound::Publish(publish) => self.emit_publish(&session, publish).await?,
                    }
                }

                _ = tokio::time::sleep_until(deadline), if keep_alive > 0 => {
                    debug!("keep alive timeout for {}", client.client_id);
                    return Err(ConnectionError::KeepAliveTimeout);
                }
            }
        }
    }

    /// Dispatch one inbound packet
    async fn handle_packet(
        &mut self,
        client: &ClientInfo,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<Control, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => {
                self.handle_publish(client, session, publish).await?;
                Ok(Control::Continue)
            }
            Packet::PubAck(puback) => {
                self.handle_puback(session, puback.packet_id).await?;
                Ok(Control::Continue)
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(session, pubrec.packet_id).await?;
                Ok(Control::Continue)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(session, pubrel.packet_id).await?;
                Ok(Control::Continue)
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(session, pubcomp.packet_id).await?;
                Ok(Control::Continue)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client, session, subscribe).await?;
                Ok(Control::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client, session, unsubscribe).await?;
                Ok(Control::Continue)
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
                Ok(Control::Continue)
            }
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client.client_id);
                Ok(Control::Disconnect)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "server-to-client packet received from client",
                )))
            }
        }
    }

    /// Encode and write one packet to the socket
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Emit one outbound publish at its effective QoS.
    ///
    /// QoS 0 goes straight to the wire. QoS 1/2 takes a packet id and an
    /// in-flight slot first; when the in-flight window is full it waits
    /// in the pending queue until an ack frees a slot.
    pub(crate) async fn emit_publish(
        &mut self,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        if publish.qos == QoS::AtMostOnce {
            return self.write_packet(&Packet::Publish(publish)).await;
        }

        let ready = {
            let mut s = session.write();
            if s.in_flight.len() >= s.limits.max_inflight {
                if s.pending_is_full() {
                    return Err(ConnectionError::ResourceExhausted);
                }
                s.queue_message(publish);
                None
            } else {
                let pid = s.next_packet_id().map_err(ConnectionError::Protocol)?;
                publish.packet_id = Some(pid);
                s.insert_in_flight(pid, publish.clone());
                Some(publish)
            }
        };

        if let Some(publish) = ready {
            self.write_packet(&Packet::Publish(publish)).await?;
        }
        Ok(())
    }

    /// Promote queued messages into freed in-flight slots
    pub(crate) async fn drain_pending(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        loop {
            let next = {
                let mut s = session.write();
                if s.in_flight.len() >= s.limits.max_inflight {
                    None
                } else {
                    s.pop_pending()
                }
            };
            match next {
                Some(publish) => self.emit_publish(session, publish).await?,
                None => return Ok(()),
            }
        }
    }

}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        // Return pooled buffers for reuse by later connections
        buffer_pool::put(std::mem::take(&mut self.read_buf));
        buffer_pool::put(std::mem::take(&mut self.write_buf));
    }
}
