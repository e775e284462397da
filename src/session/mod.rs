//! MQTT session state
//!
//! Per-client state that outlives a single connection when the clean
//! session flag is unset: subscriptions, the inbound QoS 2 dedup window,
//! the bounded pending queue and the in-flight table driving QoS 1/2
//! delivery.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{ProtocolError, Publish, QoS, Will};

/// Delivery state of an in-flight outbound PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK
    AwaitingPuback,
    /// QoS 2 PUBLISH sent, waiting for PUBREC
    AwaitingPubrec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    AwaitingPubcomp,
}

/// An outbound QoS 1/2 message awaiting its terminal acknowledgement
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub state: InflightState,
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// Outcome of queueing a message into the bounded pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Queued,
    /// The queue was full; the oldest message was evicted to make room
    DroppedOldest,
}

/// Bounds applied to a session's queues
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_pending: usize,
    pub max_inflight: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            max_inflight: 32,
        }
    }
}

/// Per-client session
pub struct Session {
    pub client_id: Arc<str>,
    /// Clean session flag from the CONNECT that owns this session
    pub clean_session: bool,
    /// Negotiated keep alive in seconds (0 disables the timeout)
    pub keep_alive: u16,
    /// True when the broker generated the client identifier
    pub assigned_id: bool,
    /// Topic filter -> granted QoS; re-subscribing overwrites
    pub subscriptions: HashMap<String, QoS>,
    /// Packet ids of QoS 2 PUBLISHes received but not yet released
    pub inbound_qos2: HashSet<u16>,
    /// Outbound messages awaiting a terminal ack, in packet-id order so
    /// a resume re-emits them deterministically
    pub in_flight: BTreeMap<u16, InflightMessage>,
    /// Messages waiting for the client to come back or the pipe to drain
    pending: VecDeque<Publish>,
    pub limits: SessionLimits,
    next_packet_id: u16,
    /// Will message registered by the owning CONNECT
    pub will: Option<Will>,
    /// Generation of the attached connection, None while offline.
    /// The registry entry with the same generation holds the channel.
    pub connection: Option<u64>,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, limits: SessionLimits) -> Self {
        Self {
            client_id,
            clean_session,
            keep_alive: 0,
            assigned_id: false,
            subscriptions: HashMap::new(),
            inbound_qos2: HashSet::new(),
            in_flight: BTreeMap::new(),
            pending: VecDeque::new(),
            limits,
            next_packet_id: 1,
            will: None,
            connection: None,
        }
    }

    pub fn attach(&mut self, generation: u64) {
        self.connection = Some(generation);
    }

    pub fn detach(&mut self) {
        self.connection = None;
    }

    /// Allocate the next packet identifier: monotone modulo 2^16,
    /// skipping 0 and ids still in flight. A full table is an error.
    pub fn next_packet_id(&mut self) -> Result<u16, ProtocolError> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            if id != 0 && !self.in_flight.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ProtocolError::PacketIdExhausted)
    }

    /// Whether another message fits in the pending queue
    pub fn pending_is_full(&self) -> bool {
        self.pending.len() >= self.limits.max_pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a message for later delivery, evicting the oldest entry
    /// when the queue is full.
    pub fn queue_message(&mut self, publish: Publish) -> QueueResult {
        let result = if self.pending.len() >= self.limits.max_pending {
            self.pending.pop_front();
            QueueResult::DroppedOldest
        } else {
            QueueResult::Queued
        };
        self.pending.push_back(publish);
        result
    }

    /// Dequeue the oldest pending message
    pub fn pop_pending(&mut self) -> Option<Publish> {
        self.pending.pop_front()
    }

    /// Iterate queued messages without draining them
    pub fn pending_iter(&self) -> impl Iterator<Item = &Publish> {
        self.pending.iter()
    }

    /// Record an outbound QoS 1/2 message as in flight
    pub fn insert_in_flight(&mut self, packet_id: u16, publish: Publish) {
        let state = match publish.qos {
            QoS::AtLeastOnce => InflightState::AwaitingPuback,
            QoS::ExactlyOnce => InflightState::AwaitingPubrec,
            // QoS 0 is never tracked
            QoS::AtMostOnce => return,
        };
        self.in_flight.insert(
            packet_id,
            InflightMessage {
                publish,
                state,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
    }

    pub fn add_subscription(&mut self, filter: String, granted: QoS) {
        self.subscriptions.insert(filter, granted);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }
}

/// Registry of sessions by client identifier.
///
/// The broker holds at most one session per client id; CONNECT-time
/// create/reuse/discard decisions live in the connection handshake, which
/// serializes them per client via the takeover protocol.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    pub fn insert(&self, session: Arc<RwLock<Session>>) {
        let client_id = session.read().client_id.clone();
        self.sessions.insert(client_id, session);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_session() -> Session {
        Session::new("c1".into(), true, SessionLimits::default())
    }

    fn test_publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn packet_ids_skip_zero_and_wrap() {
        let mut s = test_session();
        s.next_packet_id = u16::MAX;
        assert_eq!(s.next_packet_id().unwrap(), u16::MAX);
        // wraps past 0 to 1
        assert_eq!(s.next_packet_id().unwrap(), 1);
    }

    #[test]
    fn packet_ids_skip_in_flight() {
        let mut s = test_session();
        let mut p = test_publish(QoS::AtLeastOnce);
        p.packet_id = Some(1);
        s.insert_in_flight(1, p.clone());
        s.insert_in_flight(2, p);

        assert_eq!(s.next_packet_id().unwrap(), 3);
    }

    #[test]
    fn packet_id_exhaustion_is_an_error() {
        let mut s = test_session();
        let p = test_publish(QoS::AtLeastOnce);
        for id in 1..=u16::MAX {
            s.insert_in_flight(id, p.clone());
        }
        assert_eq!(
            s.next_packet_id(),
            Err(ProtocolError::PacketIdExhausted)
        );
    }

    #[test]
    fn qos0_is_never_tracked_in_flight() {
        let mut s = test_session();
        s.insert_in_flight(1, test_publish(QoS::AtMostOnce));
        assert!(s.in_flight.is_empty());
    }

    #[test]
    fn pending_queue_evicts_oldest_when_full() {
        let mut s = Session::new(
            "c1".into(),
            false,
            SessionLimits {
                max_pending: 2,
                max_inflight: 32,
            },
        );

        assert_eq!(s.queue_message(test_publish(QoS::AtLeastOnce)), QueueResult::Queued);
        assert_eq!(s.queue_message(test_publish(QoS::AtLeastOnce)), QueueResult::Queued);
        assert_eq!(
            s.queue_message(test_publish(QoS::AtLeastOnce)),
            QueueResult::DroppedOldest
        );
        assert_eq!(s.pending_len(), 2);
    }

    #[test]
    fn resubscribe_overwrites() {
        let mut s = test_session();
        s.add_subscription("a/b".to_string(), QoS::AtMostOnce);
        s.add_subscription("a/b".to_string(), QoS::ExactlyOnce);
        assert_eq!(s.subscriptions.len(), 1);
        assert_eq!(s.subscriptions["a/b"], QoS::ExactlyOnce);
    }

    #[test]
    fn store_holds_one_session_per_id() {
        let store = SessionStore::new();
        store.insert(Arc::new(RwLock::new(test_session())));
        store.insert(Arc::new(RwLock::new(test_session())));
        assert_eq!(store.len(), 1);
    }
}
