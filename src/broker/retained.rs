//! Retained message store
//!
//! Maps exact topic names to the last PUBLISH received with RETAIN=1.
//! An empty-payload retained PUBLISH clears the entry.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::{Publish, QoS};
use crate::topic::topic_matches_filter;

/// A stored retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Store of retained messages keyed by topic name
pub struct RetainedStore {
    messages: DashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }

    /// Apply a retained PUBLISH: empty payload deletes, anything else
    /// replaces the entry for the topic.
    pub fn store(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.messages.remove(publish.topic.as_ref());
        } else {
            self.messages.insert(
                publish.topic.to_string(),
                RetainedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                },
            );
        }
    }

    /// The retained message for an exact topic, if any
    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.get(topic).map(|e| e.clone())
    }

    /// All retained messages whose topic matches the filter
    pub fn matches(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retained_publish(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn last_retained_wins() {
        let store = RetainedStore::new();
        store.store(&retained_publish("a/b", b"one"));
        store.store(&retained_publish("a/b", b"two"));

        let msg = store.get("a/b").unwrap();
        assert_eq!(&msg.payload[..], b"two");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_payload_clears_entry() {
        let store = RetainedStore::new();
        store.store(&retained_publish("a/b", b"one"));
        store.store(&retained_publish("a/b", b""));

        assert!(store.get("a/b").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn lookup_by_filter() {
        let store = RetainedStore::new();
        store.store(&retained_publish("a/b", b"1"));
        store.store(&retained_publish("a/c", b"2"));
        store.store(&retained_publish("x/y", b"3"));

        let mut topics: Vec<_> = store
            .matches("a/+")
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["a/b", "a/c"]);

        assert_eq!(store.matches("#").len(), 3);
        assert!(store.matches("b/+").is_empty());
    }
}
