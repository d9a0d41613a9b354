//! Application state shared across request handlers.

use std::sync::Arc;

use crate::engine::Reconciler;
use crate::records::RecordStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { reconciler }),
        }
    }

    /// The reconciler shared with the listener.
    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn records(&self) -> &RecordStore {
        self.inner.reconciler.records()
    }
}
