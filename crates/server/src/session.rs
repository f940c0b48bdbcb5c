// Session membership and fan-out for the relay

use protocol::{BroadcastMessage, ClientId, Document, PresenceRecord, ServerMessage, SessionKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Represents a client connected to a session
#[derive(Debug, Clone)]
pub struct Member {
    pub sender: mpsc::UnboundedSender<ServerMessage>,

    /// Last record the client tracked, if any
    pub presence: Option<PresenceRecord>,
}

/// One live session: its members and their presence
#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,

    /// Connected members
    pub(crate) members: HashMap<ClientId, Member>,

    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Held across a durable write and its fan-out
    writes: Arc<Mutex<()>>,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Session {
            key,
            members: HashMap::new(),
            created_at: chrono::Utc::now(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Add a member; it receives the current presence set straight away
    pub async fn add_member(&mut self, id: ClientId, sender: mpsc::UnboundedSender<ServerMessage>) {
        let _ = sender.send(ServerMessage::PresenceSync {
            records: self.presence_records(),
        });

        self.members.insert(
            id,
            Member {
                sender,
                presence: None,
            },
        );

        tracing::info!(
            "Client {} joined session {} ({} members)",
            id,
            self.key,
            self.member_count()
        );
    }

    /// Remove a member, releasing its presence and soft locks
    pub async fn remove_member(&mut self, id: ClientId) -> bool {
        let Some(member) = self.members.remove(&id) else {
            return false;
        };

        if member.presence.is_some() {
            self.sync_presence().await;
        }

        tracing::info!("Client {} left session {}", id, self.key);
        true
    }

    /// Lock ordering durable writes, so members hear about them in the
    /// order they landed in storage
    pub fn write_lock(&self) -> Arc<Mutex<()>> {
        self.writes.clone()
    }

    /// Get member count
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if session is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Relay a field update to everyone but its sender.
    ///
    /// The sender id is stamped from the connection, never trusted from the
    /// payload.
    pub async fn publish(&self, from: ClientId, mut message: BroadcastMessage) {
        message.sender_id = from;
        self.broadcast_except(from, ServerMessage::Broadcast { message }).await;
    }

    /// Replace a member's presence record and sync everyone
    pub async fn track(&mut self, from: ClientId, mut record: PresenceRecord) {
        record.client_id = from;
        if let Some(member) = self.members.get_mut(&from) {
            member.presence = Some(record);
            self.sync_presence().await;
        }
    }

    /// Drop a member's presence record and sync everyone
    pub async fn untrack(&mut self, from: ClientId) {
        let removed = self
            .members
            .get_mut(&from)
            .and_then(|member| member.presence.take());
        if removed.is_some() {
            self.sync_presence().await;
        }
    }

    /// Tell every member, writer included, that the durable document changed
    pub async fn document_changed(&self, document: Document) {
        self.broadcast(ServerMessage::DocumentChanged { document }).await;
    }

    /// Presence records of every member that tracked one, ordered by client
    pub fn presence_records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .members
            .values()
            .filter_map(|member| member.presence.clone())
            .collect();
        records.sort_by_key(|record| record.client_id);
        records
    }

    async fn sync_presence(&self) {
        let records = self.presence_records();
        self.broadcast(ServerMessage::PresenceSync { records }).await;
    }

    /// Broadcast message to all members
    async fn broadcast(&self, message: ServerMessage) {
        for member in self.members.values() {
            let _ = member.sender.send(message.clone());
        }
    }

    /// Broadcast message to all members except one
    async fn broadcast_except(&self, except: ClientId, message: ServerMessage) {
        for (id, member) in &self.members {
            if *id != except {
                let _ = member.sender.send(message.clone());
            }
        }
    }
}

/// Shared session state
pub type SharedSession = Arc<RwLock<Session>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn member(session: &mut Session) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        session.add_member(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_member_management() {
        let mut session = Session::new(SessionKey::new("ROOM42"));
        let (a, mut rx_a) = member(&mut session).await;

        // New member gets the current presence set
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMessage::PresenceSync { records }) if records.is_empty()
        ));
        assert_eq!(session.member_count(), 1);

        assert!(session.remove_member(a).await);
        assert!(!session.remove_member(a).await);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_publish_skips_sender_and_stamps_it() {
        let mut session = Session::new(SessionKey::new("ROOM42"));
        let (a, mut rx_a) = member(&mut session).await;
        let (_b, mut rx_b) = member(&mut session).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        let mut updates = Document::new();
        updates.insert("counter".to_string(), json!(3));
        let spoofed = BroadcastMessage {
            sender_id: ClientId::new(),
            timestamp: 1,
            field_updates: updates,
        };
        session.publish(a, spoofed).await;

        match rx_b.recv().await {
            Some(ServerMessage::Broadcast { message }) => assert_eq!(message.sender_id, a),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_departure_syncs_presence() {
        let mut session = Session::new(SessionKey::new("ROOM42"));
        let (a, mut rx_a) = member(&mut session).await;
        let (b, mut rx_b) = member(&mut session).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        let mut record = PresenceRecord::new(b, "Birch");
        record.editing_fields.insert("journal".to_string());
        session.track(b, record).await;

        match rx_a.recv().await {
            Some(ServerMessage::PresenceSync { records }) => {
                assert_eq!(records.len(), 1);
                assert!(records[0].is_editing("journal"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        session.remove_member(b).await;
        assert!(matches!(
            rx_a.recv().await,
            Some(ServerMessage::PresenceSync { records }) if records.is_empty()
        ));
        assert_eq!(session.presence_records().len(), 0);
        assert!(session.members.contains_key(&a));
    }
}
