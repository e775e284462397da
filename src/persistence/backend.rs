//! Session persistence port
//!
//! The broker persists session snapshots through this trait on detach
//! and deletes them on session destruction. Backends may store them
//! anywhere; the default keeps them in memory for the process lifetime.

use async_trait::async_trait;

use super::error::Result;
use super::models::SessionSnapshot;

/// Storage port for session state
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Load every stored session at broker startup
    async fn load_sessions(&self) -> Result<Vec<SessionSnapshot>>;

    /// Store or replace one session snapshot
    async fn save_session(&self, snapshot: SessionSnapshot) -> Result<()>;

    /// Remove a stored session
    async fn delete_session(&self, client_id: &str) -> Result<()>;
}
