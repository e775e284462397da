//! Persistence error types

use std::fmt;

/// Errors surfaced by a persistence backend
#[derive(Debug)]
pub enum PersistenceError {
    /// Snapshot (de)serialization failed
    Serialization(String),
    /// The backend itself failed
    Backend(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::Backend(msg) => write!(f, "backend error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

pub type Result<T> = std::result::Result<T, PersistenceError>;
