//! Pluggable session persistence
//!
//! The port the broker uses to save and restore session state. The
//! default backend keeps snapshots in memory, so sessions survive
//! reconnects but not process restarts; durable backends implement the
//! same trait.

mod backend;
mod error;
mod models;

pub use backend::SessionBackend;
pub use error::{PersistenceError, Result};
pub use models::{SessionSnapshot, StoredInflight, StoredMessage, StoredSubscription};

use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory session backend, the default
pub struct MemoryBackend {
    sessions: DashMap<String, SessionSnapshot>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn load_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        Ok(self.sessions.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_session(&self, snapshot: SessionSnapshot) -> Result<()> {
        self.sessions.insert(snapshot.client_id.clone(), snapshot);
        Ok(())
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use crate::session::{Session, SessionLimits};

    fn snapshot(client_id: &str) -> SessionSnapshot {
        let mut session = Session::new(client_id.into(), false, SessionLimits::default());
        session.add_subscription("a/b".to_string(), QoS::AtLeastOnce);
        SessionSnapshot::from_session(&session)
    }

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.save_session(snapshot("c1")).await.unwrap();
        backend.save_session(snapshot("c2")).await.unwrap();

        let loaded = backend.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 2);

        backend.delete_session("c1").await.unwrap();
        assert_eq!(backend.load_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_restores_subscriptions_and_queues() {
        let mut original = Session::new("c1".into(), false, SessionLimits::default());
        original.add_subscription("a/+".to_string(), QoS::ExactlyOnce);
        original.queue_message(crate::protocol::Publish {
            qos: QoS::AtLeastOnce,
            topic: "a/b".into(),
            payload: bytes::Bytes::from_static(b"queued"),
            ..Default::default()
        });

        let snapshot = SessionSnapshot::from_session(&original);
        let mut restored = Session::new("c1".into(), false, SessionLimits::default());
        snapshot.restore_into(&mut restored);

        assert_eq!(restored.subscriptions["a/+"], QoS::ExactlyOnce);
        assert_eq!(restored.pending_len(), 1);
    }
}
