//! Per-instance mutual exclusion.
//!
//! Every write to an instance's record pair, and every "is the host record
//! still there?" check that leads to a removal, happens while holding the
//! instance's lock so the two records are never observed half-written by
//! another scheduler.

use std::future::Future;
use std::sync::Arc;

use shepherd_coord::{Coordinator, Lock};
use shepherd_id::InstanceId;
use tracing::{trace, warn};

use crate::error::{EngineError, EngineResult};
use crate::paths;

/// The distributed lock guarding one instance's records.
pub struct InstanceLock {
    instance_id: InstanceId,
    inner: Lock,
}

impl InstanceLock {
    pub fn new(conn: Arc<dyn Coordinator>, instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            inner: Lock::new(conn, paths::instance_lock(&instance_id)),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Wait until the lock is held.
    pub async fn lock(&mut self) -> EngineResult<()> {
        self.inner.lock().await.map_err(EngineError::Lock)?;
        trace!(instance_id = %self.instance_id, "Instance lock acquired");
        Ok(())
    }

    /// Release the lock.
    pub async fn unlock(&mut self) -> EngineResult<()> {
        self.inner.unlock().await.map_err(EngineError::Lock)?;
        trace!(instance_id = %self.instance_id, "Instance lock released");
        Ok(())
    }
}

/// Run `op` while holding the lock for `instance_id`.
///
/// `op` is not polled until the lock is held. The lock is released whether
/// or not `op` succeeds; an error from `op` takes precedence over an error
/// releasing the lock.
pub async fn with_instance_lock<T, F>(
    conn: Arc<dyn Coordinator>,
    instance_id: InstanceId,
    op: F,
) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    let mut lock = InstanceLock::new(conn, instance_id);
    if let Err(e) = lock.lock().await {
        // Withdraw a contender node left behind by a failed wait.
        let _ = lock.unlock().await;
        return Err(e);
    }

    let result = op.await;
    let released = lock.unlock().await;

    match (result, released) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => {
            warn!(%instance_id, error = %e, "Failed to release instance lock");
            Err(e)
        }
        (Ok(value), Ok(())) => Ok(value),
    }
}
