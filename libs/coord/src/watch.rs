//! One-shot change notifications.

use tokio::sync::oneshot;

use crate::{CoordError, CoordResult};

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The watched node was created.
    Created,
    /// The watched node was deleted.
    Deleted,
    /// The watched node's payload changed.
    DataChanged,
    /// A child of the watched node was created or deleted.
    ChildrenChanged,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path the watch was registered on.
    pub path: String,
    /// Kind of change.
    pub kind: EventKind,
}

/// A pending one-shot watch.
///
/// Fires at most once. Dropping it cancels interest; backends prune
/// abandoned watches lazily.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Create a watch and the sender a backend fires it with.
    pub fn channel() -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the watch to fire.
    pub async fn changed(self) -> CoordResult<WatchEvent> {
        self.rx.await.map_err(|_| CoordError::Closed)
    }
}
