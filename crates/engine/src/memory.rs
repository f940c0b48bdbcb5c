// In-process hub implementing every collaborator contract
//
// Lets several sessions in one process share channels and a store. Used by
// the test suites and handy for embedding the engine without a relay.

use crate::error::{StoreError, TransportError};
use crate::transport::{BroadcastTransport, DurableStore, PresenceTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{BroadcastMessage, ClientId, Document, PresenceRecord, SessionKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct HubSession {
    /// Broadcast subscribers by client
    members: HashMap<ClientId, mpsc::UnboundedSender<BroadcastMessage>>,

    presence_subscribers: HashMap<ClientId, mpsc::UnboundedSender<Vec<PresenceRecord>>>,
    records: HashMap<ClientId, PresenceRecord>,

    document: Option<Document>,
    watchers: Vec<mpsc::UnboundedSender<Document>>,
    upserts: usize,
}

impl HubSession {
    /// Send the record set to every presence subscriber. A subscriber whose
    /// receiver is gone counts as disconnected: its record is pruned and the
    /// rest are synced again.
    fn sync_presence(&mut self) {
        loop {
            let mut lost: Vec<ClientId> = self
                .presence_subscribers
                .iter()
                .filter(|(_, tx)| tx.is_closed())
                .map(|(id, _)| *id)
                .collect();

            if lost.is_empty() {
                let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
                records.sort_by_key(|r| r.client_id);

                lost = self
                    .presence_subscribers
                    .iter()
                    .filter(|(_, tx)| tx.send(records.clone()).is_err())
                    .map(|(id, _)| *id)
                    .collect();
                if lost.is_empty() {
                    return;
                }
            }

            for client in lost {
                tracing::debug!("Pruning presence of lost client {}", client);
                self.presence_subscribers.remove(&client);
                self.members.remove(&client);
                self.records.remove(&client);
            }
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    sessions: HashMap<SessionKey, HubSession>,

    /// Upserts left to fail, across all sessions
    failing_upserts: usize,
}

/// Shared in-memory broadcast channel, presence channel and durable store
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the durable document for a session without notifying watchers.
    pub fn seed(&self, session: &SessionKey, document: Document) {
        let mut state = self.inner.lock();
        state
            .sessions
            .entry(session.clone())
            .or_default()
            .document = Some(document);
    }

    /// Current durable document for a session
    pub fn stored(&self, session: &SessionKey) -> Option<Document> {
        let state = self.inner.lock();
        state
            .sessions
            .get(session)
            .and_then(|s| s.document.clone())
    }

    /// Number of successful upserts a session has received
    pub fn upsert_count(&self, session: &SessionKey) -> usize {
        let state = self.inner.lock();
        state.sessions.get(session).map_or(0, |s| s.upserts)
    }

    /// Make the next `count` upserts fail with a backend error.
    pub fn fail_next_upserts(&self, count: usize) {
        self.inner.lock().failing_upserts = count;
    }

    /// Number of clients subscribed to a session's broadcast channel
    pub fn member_count(&self, session: &SessionKey) -> usize {
        let state = self.inner.lock();
        state.sessions.get(session).map_or(0, |s| s.members.len())
    }

    /// Drop a client the way a lost connection would: its broadcast and
    /// presence subscriptions go away and the others get a presence sync.
    pub fn disconnect(&self, session: &SessionKey, client: ClientId) {
        let mut state = self.inner.lock();
        if let Some(hub_session) = state.sessions.get_mut(session) {
            hub_session.members.remove(&client);
            hub_session.presence_subscribers.remove(&client);
            if hub_session.records.remove(&client).is_some() {
                hub_session.sync_presence();
            }
        }
    }
}

#[async_trait]
impl BroadcastTransport for MemoryHub {
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<BroadcastMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state
            .sessions
            .entry(session.clone())
            .or_default()
            .members
            .insert(client, tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        session: &SessionKey,
        message: BroadcastMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        let hub_session = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| TransportError::WrongSession(session.to_string()))?;

        // Everyone except the sender; drop subscribers whose receiver is gone
        let sender = message.sender_id;
        hub_session
            .members
            .retain(|id, tx| *id == sender || tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn close(&self, session: &SessionKey, client: ClientId) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        if let Some(hub_session) = state.sessions.get_mut(session) {
            hub_session.members.remove(&client);
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceTransport for MemoryHub {
    async fn subscribe(
        &self,
        session: &SessionKey,
        client: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<Vec<PresenceRecord>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        let hub_session = state.sessions.entry(session.clone()).or_default();
        hub_session.presence_subscribers.insert(client, tx);
        hub_session.sync_presence();
        Ok(rx)
    }

    async fn track(
        &self,
        session: &SessionKey,
        record: PresenceRecord,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        let hub_session = state.sessions.entry(session.clone()).or_default();
        hub_session.records.insert(record.client_id, record);
        hub_session.sync_presence();
        Ok(())
    }

    async fn untrack(&self, session: &SessionKey, client: ClientId) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        if let Some(hub_session) = state.sessions.get_mut(session) {
            hub_session.presence_subscribers.remove(&client);
            hub_session.records.remove(&client);
            hub_session.sync_presence();
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryHub {
    async fn select(&self, session: &SessionKey) -> Result<Option<Document>, StoreError> {
        Ok(self.stored(session))
    }

    async fn upsert(&self, session: &SessionKey, document: &Document) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(StoreError::Backend("injected upsert failure".to_string()));
        }

        let hub_session = state.sessions.entry(session.clone()).or_default();
        hub_session.document = Some(document.clone());
        hub_session.upserts += 1;
        hub_session
            .watchers
            .retain(|tx| tx.send(document.clone()).is_ok());
        Ok(())
    }

    async fn watch(
        &self,
        session: &SessionKey,
    ) -> Result<mpsc::UnboundedReceiver<Document>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state
            .sessions
            .entry(session.clone())
            .or_default()
            .watchers
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(sender: ClientId, counter: i64) -> BroadcastMessage {
        let mut updates = Document::new();
        updates.insert("counter".to_string(), json!(counter));
        BroadcastMessage {
            sender_id: sender,
            timestamp: 1,
            field_updates: updates,
        }
    }

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let hub = MemoryHub::new();
        let session = SessionKey::new("ROOM");
        let (a, b) = (ClientId::new(), ClientId::new());

        let mut rx_a = BroadcastTransport::subscribe(&hub, &session, a).await.unwrap();
        let mut rx_b = BroadcastTransport::subscribe(&hub, &session, b).await.unwrap();

        hub.publish(&session, message(a, 3)).await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().sender_id, a);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_upsert_notifies_watchers_and_counts() {
        let hub = MemoryHub::new();
        let session = SessionKey::new("ROOM");
        let mut changes = hub.watch(&session).await.unwrap();

        let mut doc = Document::new();
        doc.insert("counter".to_string(), json!(2));
        hub.upsert(&session, &doc).await.unwrap();

        assert_eq!(changes.recv().await.unwrap(), doc);
        assert_eq!(hub.upsert_count(&session), 1);
        assert_eq!(hub.select(&session).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let hub = MemoryHub::new();
        let session = SessionKey::new("ROOM");
        hub.fail_next_upserts(1);

        assert!(hub.upsert(&session, &Document::new()).await.is_err());
        assert!(hub.upsert(&session, &Document::new()).await.is_ok());
        assert_eq!(hub.upsert_count(&session), 1);
    }

    #[tokio::test]
    async fn test_presence_sync_on_track_and_disconnect() {
        let hub = MemoryHub::new();
        let session = SessionKey::new("ROOM");
        let (a, b) = (ClientId::new(), ClientId::new());

        let mut rx = PresenceTransport::subscribe(&hub, &session, a).await.unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        hub.track(&session, PresenceRecord::new(b, "Bo")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        hub.disconnect(&session, b);
        assert!(rx.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned_on_next_sync() {
        let hub = MemoryHub::new();
        let session = SessionKey::new("ROOM");
        let (a, b) = (ClientId::new(), ClientId::new());

        let mut rx_a = PresenceTransport::subscribe(&hub, &session, a).await.unwrap();
        let rx_b = PresenceTransport::subscribe(&hub, &session, b).await.unwrap();
        hub.track(&session, PresenceRecord::new(b, "Bo")).await.unwrap();
        drop(rx_b);

        hub.track(&session, PresenceRecord::new(a, "Al")).await.unwrap();

        let mut latest = Vec::new();
        while let Ok(records) = rx_a.try_recv() {
            latest = records;
        }
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].client_id, a);
    }
}
