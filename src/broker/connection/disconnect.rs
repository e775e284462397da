//! Close sequence and will emission
//!
//! Runs on every exit path from the connected state: deregisters the
//! connection, preserves undelivered traffic for persistent sessions,
//! publishes the will on abnormal termination and tears down clean
//! sessions.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError, State};
use crate::broker::router::Outbound;
use crate::hooks::{contain_panic, SessionTerminatedReason};
use crate::persistence::SessionSnapshot;
use crate::protocol::{Publish, QoS};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Close the connection and release everything it owns.
    ///
    /// `error` is present for abnormal terminations (the will is
    /// published). `takeover` leaves the session registry untouched: the
    /// displacing CONNECT decides the session's fate.
    pub(crate) async fn handle_close(&mut self, error: Option<&ConnectionError>, takeover: bool) {
        let State::Connected { client, session } = &self.state else {
            // Pre-handshake close: nothing was registered
            return;
        };
        let client = client.clone();
        let session = session.clone();

        // Detach only if no successor connection has attached in the
        // meantime; a displaced connection closing late must not touch
        // state the takeover now owns
        let owns_session = {
            let mut s = session.write();
            if s.connection == Some(self.generation) {
                s.detach();
                true
            } else {
                false
            }
        };

        if owns_session {
            // Preserve routed-but-undelivered messages for the next
            // connection of a persistent session
            let persistent = !session.read().clean_session;
            while let Ok(Outbound::Publish(publish)) = self.outbound_rx.try_recv() {
                if persistent && publish.qos != QoS::AtMostOnce {
                    session.write().queue_message(publish);
                }
            }

            let will = session.write().will.take();

            // A clean DISCONNECT discards the will; every other close
            // publishes it
            if error.is_some() {
                if let Some(will) = will {
                    debug!(
                        "publishing will for {} to {:?}",
                        client.client_id, will.topic
                    );
                    let publish = Publish {
                        dup: false,
                        qos: will.qos,
                        retain: will.retain,
                        topic: will.topic.as_str().into(),
                        packet_id: None,
                        payload: will.payload,
                    };
                    self.router.publish(&publish);
                }
            }
        }

        if !takeover && owns_session {
            if client.clean_session {
                self.router.sessions.remove(&client.client_id);
                self.router.subscriptions.remove_client(&client.client_id);
                if let Err(e) = self.persistence.delete_session(&client.client_id).await {
                    warn!(
                        "failed to delete persisted session {}: {}",
                        client.client_id, e
                    );
                }
                contain_panic(
                    "on_session_terminated",
                    (),
                    self.hooks
                        .on_session_terminated(&client, SessionTerminatedReason::Normal),
                )
                .await;
            } else {
                let snapshot = SessionSnapshot::from_session(&session.read());
                if let Err(e) = self.persistence.save_session(snapshot).await {
                    warn!("failed to persist session {}: {}", client.client_id, e);
                }
            }
        }

        let rendered = error.map(|e| e.to_string());
        contain_panic(
            "on_close",
            (),
            self.hooks.on_close(&client, rendered.as_deref()),
        )
        .await;

        // Deregister last so shutdown observes the close sequence as
        // finished once the registry drains. Only our own entry goes; a
        // takeover successor may already hold the slot.
        self.router
            .connections
            .remove_if(&client.client_id, |_, h| h.generation == self.generation);

        debug!("client {} disconnected", client.client_id);
    }
}
