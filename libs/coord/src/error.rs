//! Coordination store error types.

use thiserror::Error;

/// Result type for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors returned by a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    /// The node does not exist.
    #[error("node does not exist: {0}")]
    NoNode(String),

    /// A node already exists at the path.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The node has children and cannot be deleted.
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// Compare-and-set failed because the node moved on.
    #[error("version conflict at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Ephemeral nodes cannot have children.
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The path is malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The session that owns this connection has ended.
    #[error("session expired")]
    SessionExpired,

    /// A watch was dropped by the backend before firing.
    #[error("watch closed")]
    Closed,

    /// The backend could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl CoordError {
    /// Returns true for a missing node.
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode(_))
    }

    /// Returns true for errors that a caller should retry after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed)
    }
}
