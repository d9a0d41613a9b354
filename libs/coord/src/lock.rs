//! Distributed exclusive lock built on ephemeral-sequential nodes.
//!
//! Each contender creates `{dir}/lock-NNNNNNNNNN`; the lowest sequence holds
//! the lock. Because contender nodes are ephemeral, a holder whose session
//! ends releases the lock without any cooperation.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::path;
use crate::{CoordError, CoordResult, Coordinator, CreateMode};

const LOCK_PREFIX: &str = "lock-";

/// A named exclusive lock.
///
/// `lock()` waits without bound; callers needing a deadline wrap it in
/// `tokio::time::timeout` and must still call `unlock()` afterwards to
/// withdraw their contender node. A `Lock` dropped while held stays held
/// until its session ends.
pub struct Lock {
    conn: Arc<dyn Coordinator>,
    dir: String,
    node: Option<String>,
}

impl Lock {
    /// Create a lock rooted at `dir`. Nothing is written until `lock()`.
    pub fn new(conn: Arc<dyn Coordinator>, dir: impl Into<String>) -> Self {
        Self {
            conn,
            dir: dir.into(),
            node: None,
        }
    }

    /// The lock's directory.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Returns true while this handle holds the lock or is queued for it.
    pub fn is_held(&self) -> bool {
        self.node.is_some()
    }

    /// Acquire the lock, waiting for earlier contenders to release it.
    pub async fn lock(&mut self) -> CoordResult<()> {
        if self.node.is_some() {
            return Ok(());
        }

        let prefix = path::join(&self.dir, [LOCK_PREFIX]);
        let node = self
            .conn
            .create(&prefix, Vec::new(), CreateMode::EphemeralSequential)
            .await?;
        let name = path::name(&node).to_string();
        // Stored before waiting so unlock() can withdraw a contender whose
        // wait was abandoned.
        self.node = Some(node.clone());

        loop {
            let (children, watch) = match self.conn.children_w(&self.dir).await {
                Ok(result) => result,
                Err(e) => {
                    self.withdraw().await;
                    return Err(e);
                }
            };

            // Sequence suffixes are zero-padded, so name order is queue order.
            let position = children
                .iter()
                .filter(|c| c.starts_with(LOCK_PREFIX))
                .position(|c| *c == name);

            match position {
                Some(0) => {
                    debug!(lock = %self.dir, node = %node, "Lock acquired");
                    return Ok(());
                }
                Some(ahead) => {
                    trace!(lock = %self.dir, ahead, "Waiting for lock");
                    if let Err(e) = watch.changed().await {
                        self.withdraw().await;
                        return Err(e);
                    }
                }
                None => {
                    self.node = None;
                    return Err(CoordError::NoNode(node));
                }
            }
        }
    }

    /// Release the lock. Releasing an unheld lock is a no-op.
    pub async fn unlock(&mut self) -> CoordResult<()> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };

        match self.conn.delete(&node).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(e) => {
                self.node = Some(node);
                return Err(e);
            }
        }
        debug!(lock = %self.dir, "Lock released");

        // Best-effort removal of the lock directory once nobody is queued.
        match self.conn.delete(&self.dir).await {
            Ok(()) | Err(CoordError::NoNode(_)) | Err(CoordError::NotEmpty(_)) => {}
            Err(e) => debug!(lock = %self.dir, error = %e, "Failed to remove lock directory"),
        }
        Ok(())
    }

    async fn withdraw(&mut self) {
        if let Some(node) = self.node.take() {
            let _ = self.conn.delete(&node).await;
        }
    }
}
