// Contracts for the engine's external collaborators
//
// The engine never talks to a network or a database directly. A session is
// handed implementations of these traits at join time and releases them on
// leave.

use crate::error::{StoreError, TransportError};
use async_trait::async_trait;
use protocol::{BroadcastMessage, ClientId, Document, PresenceRecord, SessionKey};
use tokio::sync::mpsc;

/// Best-effort, at-most-once publish/subscribe channel per session
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Open the session channel for `client`. Messages published by other
    /// members arrive on the returned receiver.
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>, TransportError>;

    async fn publish(
        &self,
        session: &SessionKey,
        message: BroadcastMessage,
    ) -> Result<(), TransportError>;

    /// Close the channel opened by `subscribe`.
    async fn close(&self, session: &SessionKey, client: ClientId) -> Result<(), TransportError>;
}

/// Presence channel delivering the full record set on every change
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<Vec<PresenceRecord>>, TransportError>;

    /// Replace the caller's record
    async fn track(&self, session: &SessionKey, record: PresenceRecord)
        -> Result<(), TransportError>;

    /// Drop the caller's record and its subscription
    async fn untrack(&self, session: &SessionKey, client: ClientId) -> Result<(), TransportError>;
}

/// Authoritative whole-document store keyed by session
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// `None` when the session has never been written
    async fn select(&self, session: &SessionKey) -> Result<Option<Document>, StoreError>;

    async fn upsert(&self, session: &SessionKey, document: &Document) -> Result<(), StoreError>;

    /// Change notifications: the new document after every successful write
    /// by any client, this one included.
    async fn watch(
        &self,
        session: &SessionKey,
    ) -> Result<mpsc::UnboundedReceiver<Document>, StoreError>;
}
