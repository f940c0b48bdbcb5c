// Durable-store catch-up path
//
// Covers missed broadcasts, reconnects and late joiners. Slower than the
// broadcast path, and held to the same rule: a dirty field is never
// overwritten.

use crate::document::ChangeSet;
use crate::session::{ChangeOrigin, SessionState, Shared};
use protocol::Document;
use std::sync::Arc;
use tokio::sync::mpsc;

impl SessionState {
    /// Merge a durable change notification into the local replica.
    ///
    /// Ignored entirely while our own flush is in flight, and when the
    /// document is exactly what we last flushed (a late echo of our write).
    pub(crate) fn receive_durable(&mut self, remote: Document) -> ChangeSet {
        if self.syncing {
            tracing::debug!("Ignoring durable change while flushing");
            return ChangeSet::default();
        }
        if self.last_flushed.as_ref() == Some(&remote) {
            tracing::debug!("Ignoring echo of our own flush");
            return ChangeSet::default();
        }

        let dirty = &self.dirty;
        self.store.merge_remote(remote, |field| !dirty.is_dirty(field))
    }
}

/// Apply durable change notifications until the subscription closes.
pub(crate) async fn run_listener(
    shared: Arc<Shared>,
    mut notifications: mpsc::UnboundedReceiver<Document>,
) {
    while let Some(remote) = notifications.recv().await {
        let changes = shared.state.lock().receive_durable(remote);
        if !changes.is_empty() {
            tracing::debug!(
                "Caught up {} field(s) of {} from the durable store",
                changes.len(),
                shared.session
            );
        }
        shared.emit_changes(ChangeOrigin::Durable, changes);
    }
    tracing::debug!("Durable notifications for {} closed", shared.session);
}
