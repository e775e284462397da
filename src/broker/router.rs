//! Message routing hub
//!
//! Owns the shared broker state (session registry, subscription index,
//! retained store, connection registry) and dispatches PUBLISH messages
//! to every matching session. Routing runs on the publisher's task;
//! per-subscriber outbound channels preserve publisher order and a slow
//! subscriber never blocks the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::retained::RetainedStore;
use super::BrokerConfig;
use crate::protocol::{Publish, QoS};
use crate::session::{QueueResult, SessionStore};
use crate::topic::SubscriptionStore;

/// Why the broker asked a connection to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// A new CONNECT with the same client id is taking the session over
    Takeover,
    /// The subscriber's queues overflowed beyond policy
    ResourceExhausted,
}

/// Out-of-band close signal for a connection.
///
/// Separate from the outbound channel so a close request is never stuck
/// behind a full message queue.
pub(crate) struct CloseSignal {
    reason: Mutex<Option<CloseReason>>,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Request the connection to close. The first reason sticks.
    pub fn close(&self, reason: CloseReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.notify.notify_waiters();
    }

    /// Wait until a close is requested
    pub async fn requested(&self) -> CloseReason {
        loop {
            let notified = self.notify.notified();
            if let Some(reason) = *self.reason.lock() {
                return reason;
            }
            notified.await;
        }
    }
}

/// Messages routed to a connection's event loop
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A publish already carrying its effective QoS; the owning task
    /// assigns the packet id and tracks it in flight
    Publish(Publish),
}

/// Registry entry for a live connection
pub(crate) struct ConnectionHandle {
    pub tx: mpsc::Sender<Outbound>,
    pub close: Arc<CloseSignal>,
    /// Ties the entry to one connection instance so a stale connection
    /// never removes its successor's registration
    pub generation: u64,
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection generation
pub(crate) fn next_generation() -> u64 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Shared routing state of the broker hub
pub struct Router {
    pub(crate) sessions: SessionStore,
    pub(crate) subscriptions: SubscriptionStore,
    pub(crate) retained: RetainedStore,
    pub(crate) connections: DashMap<Arc<str>, ConnectionHandle>,
    pub(crate) config: BrokerConfig,
}

impl Router {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        Self {
            sessions: SessionStore::new(),
            subscriptions: SubscriptionStore::new(),
            retained: RetainedStore::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Update the retained store and route; the shared entry point for
    /// client publishes, will messages and server-injected messages.
    pub(crate) fn publish(&self, publish: &Publish) {
        if publish.retain && self.config.retain_available {
            self.retained.store(publish);
        }
        self.route(publish);
    }

    /// Route a PUBLISH to every matching session.
    ///
    /// A client subscribed through several matching filters receives the
    /// message once, at the highest granted QoS, capped by the publish
    /// QoS.
    fn route(&self, publish: &Publish) {
        let matches = self.subscriptions.matches(&publish.topic);
        if matches.is_empty() {
            return;
        }

        let mut client_qos: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(matches.len());
        for sub in matches {
            let entry = client_qos.entry(sub.client_id).or_insert(QoS::AtMostOnce);
            if sub.qos > *entry {
                *entry = sub.qos;
            }
        }

        for (client_id, granted) in client_qos {
            let effective = publish.qos.min(granted);
            self.deliver(&client_id, publish, effective);
        }
    }

    /// Hand one message to one subscriber session
    fn deliver(&self, client_id: &Arc<str>, publish: &Publish, effective: QoS) {
        // [MQTT-3.3.1-9] the retain flag is not forwarded to live
        // subscribers; retained delivery happens at subscribe time
        let outgoing = Publish {
            dup: false,
            qos: effective,
            retain: false,
            topic: publish.topic.clone(),
            packet_id: None,
            payload: publish.payload.clone(),
        };

        let live = self
            .connections
            .get(client_id)
            .map(|h| (h.tx.clone(), h.close.clone()));

        if let Some((tx, close)) = live {
            match tx.try_send(Outbound::Publish(outgoing)) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    // Connection is tearing down; treat as offline below
                }
                Err(TrySendError::Full(Outbound::Publish(outgoing))) => {
                    if effective == QoS::AtMostOnce {
                        trace!(client_id = %client_id, "outbound channel full, dropping QoS 0");
                        return;
                    }
                    if let Some(session) = self.sessions.get(client_id) {
                        let mut s = session.write();
                        if s.pending_is_full() {
                            drop(s);
                            warn!(
                                client_id = %client_id,
                                "pending queue overflow, closing subscriber"
                            );
                            close.close(CloseReason::ResourceExhausted);
                        } else {
                            s.queue_message(outgoing);
                        }
                    }
                    return;
                }
            }
        }

        // Offline: QoS 0 is dropped, QoS 1/2 is held by persistent
        // sessions until the client reconnects
        if effective == QoS::AtMostOnce {
            return;
        }

        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            if !s.clean_session {
                let outgoing = Publish {
                    dup: false,
                    qos: effective,
                    retain: false,
                    topic: publish.topic.clone(),
                    packet_id: None,
                    payload: publish.payload.clone(),
                };
                if s.queue_message(outgoing) == QueueResult::DroppedOldest {
                    debug!(client_id = %client_id, "offline queue full, dropped oldest message");
                }
            }
        }
    }
}
