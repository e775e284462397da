//! Topic matching and the subscription index
//!
//! Validation of topic names/filters, the topic trie and the
//! broker-wide subscription store built on top of it.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscription entry: one client on one filter
#[derive(Debug, Clone)]
pub struct Subscription {
    pub client_id: Arc<str>,
    /// Granted QoS for this filter
    pub qos: QoS,
}

/// Broker-wide subscription index.
///
/// Mutations take the write lock briefly and never across an await;
/// lookups share the read lock.
pub struct SubscriptionStore {
    trie: RwLock<TopicTrie<Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
        }
    }

    /// Add a subscription. Re-subscribing an existing `(client, filter)`
    /// pair overwrites the granted QoS; the previous QoS is returned.
    pub fn subscribe(&self, filter: &str, subscription: Subscription) -> Option<QoS> {
        let mut trie = self.trie.write();
        if let Some(subs) = trie.get_mut(filter) {
            if let Some(existing) = subs
                .iter_mut()
                .find(|s| s.client_id == subscription.client_id)
            {
                let previous = existing.qos;
                existing.qos = subscription.qos;
                Some(previous)
            } else {
                subs.push(subscription);
                None
            }
        } else {
            trie.insert(filter, vec![subscription]);
            None
        }
    }

    /// Remove one client's subscription on a filter. Empty filter nodes
    /// are pruned from the trie.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| s.client_id.as_ref() != client_id);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove every subscription of a client. Used on session teardown.
    pub fn remove_client(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// All subscriptions whose filter matches the topic name. A client
    /// subscribed through several matching filters appears once per
    /// filter; the router collapses duplicates to the highest QoS.
    pub fn matches(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let trie = self.trie.read();
        let mut result: SmallVec<[Subscription; 16]> = SmallVec::new();
        trie.matches(topic, |subs| {
            result.extend(subs.iter().cloned());
        });
        result
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client: &str, qos: QoS) -> Subscription {
        Subscription {
            client_id: client.into(),
            qos,
        }
    }

    #[test]
    fn resubscribe_overwrites_granted_qos() {
        let store = SubscriptionStore::new();

        assert_eq!(store.subscribe("a/b", sub("c1", QoS::AtMostOnce)), None);
        assert_eq!(
            store.subscribe("a/b", sub("c1", QoS::ExactlyOnce)),
            Some(QoS::AtMostOnce)
        );

        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn one_entry_per_matching_filter() {
        let store = SubscriptionStore::new();
        store.subscribe("a/#", sub("c1", QoS::AtMostOnce));
        store.subscribe("a/+", sub("c1", QoS::AtLeastOnce));
        store.subscribe("a/b", sub("c2", QoS::AtLeastOnce));

        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 3);
        assert_eq!(
            matches.iter().filter(|s| s.client_id.as_ref() == "c1").count(),
            2
        );
    }

    #[test]
    fn unsubscribe_removes_only_named_client() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));
        store.subscribe("a/b", sub("c2", QoS::AtMostOnce));

        assert!(store.unsubscribe("a/b", "c1"));
        assert!(!store.unsubscribe("a/b", "c1"));

        let matches = store.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].client_id.as_ref(), "c2");
    }

    #[test]
    fn remove_client_drops_all_filters() {
        let store = SubscriptionStore::new();
        store.subscribe("a/b", sub("c1", QoS::AtMostOnce));
        store.subscribe("x/#", sub("c1", QoS::AtLeastOnce));
        store.subscribe("x/#", sub("c2", QoS::AtLeastOnce));

        store.remove_client("c1");

        assert!(store.matches("a/b").is_empty());
        let matches = store.matches("x/y");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].client_id.as_ref(), "c2");
    }
}
