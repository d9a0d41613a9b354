//! # shepherd-coord
//!
//! The coordination store is the single source of truth for the control
//! plane and the channel through which host agents and the scheduler talk.
//! This crate defines the capability set the scheduler relies on:
//!
//! - Hierarchical nodes addressed by `/`-separated paths
//! - Persistent, ephemeral, and sequential node creation
//! - One-shot watches on a node's data or its children
//! - A lock recipe built from ephemeral-sequential nodes, released
//!   automatically when the holder's session ends
//!
//! Any backend providing linearizable per-path reads and writes plus change
//! notification can implement [`Coordinator`]. [`MemoryStore`] is the
//! in-process backend used by tests and single-node deployments.
//!
//! The connection is an explicit `Arc<dyn Coordinator>` handle threaded
//! through every component rather than a process-wide singleton.

mod error;
mod lock;
mod memory;
pub mod path;
mod watch;

use async_trait::async_trait;

pub use error::{CoordError, CoordResult};
pub use lock::Lock;
pub use memory::{MemorySession, MemoryStore};
pub use watch::{EventKind, Watch, WatchEvent};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Node lives until deleted.
    Persistent,
    /// Node is deleted when the creating session ends.
    Ephemeral,
    /// Persistent node whose name gets a per-parent sequence suffix.
    PersistentSequential,
    /// Ephemeral node whose name gets a per-parent sequence suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if nodes created with this mode are session-scoped.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Returns true if the node name gets a sequence suffix.
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// A node's payload and its data version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Raw payload.
    pub data: Vec<u8>,
    /// Incremented on every `set`; starts at 0 on create.
    pub version: u64,
}

/// The capability set of a coordination store connection.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Create a node and return the path actually created.
    ///
    /// Missing ancestors are created as empty persistent nodes. For
    /// sequential modes `path` is a prefix and the returned path carries the
    /// allocated sequence suffix.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordResult<String>;

    /// Like [`Coordinator::create`], but fails with [`CoordError::NoNode`]
    /// naming the parent instead of creating it. A node whose parent was
    /// deleted concurrently is never resurrected as an empty ancestor.
    async fn create_child(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordResult<String>;

    /// Read a node.
    async fn get(&self, path: &str) -> CoordResult<Node>;

    /// Read a node and leave a watch on its data.
    async fn get_w(&self, path: &str) -> CoordResult<(Node, Watch)>;

    /// Replace a node's payload. With `expected` set, fails with
    /// [`CoordError::BadVersion`] unless the node is at that version.
    async fn set(&self, path: &str, data: Vec<u8>, expected: Option<u64>) -> CoordResult<u64>;

    /// Delete a childless node.
    async fn delete(&self, path: &str) -> CoordResult<()>;

    /// Delete a node and all of its descendants.
    async fn delete_all(&self, path: &str) -> CoordResult<()>;

    /// Check whether a node exists.
    async fn exists(&self, path: &str) -> CoordResult<bool>;

    /// List a node's children, sorted by name.
    async fn children(&self, path: &str) -> CoordResult<Vec<String>>;

    /// List a node's children and leave a watch on the child set.
    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)>;
}
