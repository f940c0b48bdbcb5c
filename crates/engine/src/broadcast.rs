// Ephemeral broadcast path: ordered publisher and filtered receiver

use crate::document::ChangeSet;
use crate::session::{ChangeOrigin, SessionState, Shared};
use crate::transport::BroadcastTransport;
use protocol::{BroadcastMessage, SessionKey};
use std::sync::Arc;
use tokio::sync::mpsc;

impl SessionState {
    /// Merge a broadcast from another client into the local replica.
    ///
    /// Filtering, in order: our own messages are dropped; each field update
    /// must be newer than the last one admitted from that sender for that
    /// field; dirty fields are never overwritten.
    pub(crate) fn receive_broadcast(&mut self, message: BroadcastMessage) -> ChangeSet {
        if message.sender_id == self.client_id {
            return ChangeSet::default();
        }

        let sender = message.sender_id;
        let timestamp = message.timestamp;
        let watermarks = &mut self.watermarks;
        let dirty = &self.dirty;

        self.store.merge_remote(message.field_updates, |field| {
            if !watermarks.admit(sender, field, timestamp) {
                tracing::debug!("Dropping stale update to {} from {}", field, sender);
                return false;
            }
            if dirty.is_dirty(field) {
                tracing::debug!("Keeping local edit to {} over update from {}", field, sender);
                return false;
            }
            true
        })
    }
}

/// Drain inbound broadcasts into the replica until the channel closes.
pub(crate) async fn run_listener(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<BroadcastMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let sender = message.sender_id;
        let changes = shared.state.lock().receive_broadcast(message);
        shared.emit_changes(ChangeOrigin::Broadcast(sender), changes);
    }
    tracing::debug!("Broadcast channel for {} closed", shared.session);
}

/// Publish queued messages one at a time so they leave in mutation order.
///
/// Delivery is best-effort: failures are logged and the message dropped.
pub(crate) async fn run_publisher(
    transport: Arc<dyn BroadcastTransport>,
    session: SessionKey,
    mut outbound: mpsc::UnboundedReceiver<BroadcastMessage>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = transport.publish(&session, message).await {
            tracing::debug!("Broadcast on {} dropped: {}", session.broadcast_topic(), e);
        }
    }
}
