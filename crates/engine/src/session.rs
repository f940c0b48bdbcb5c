// Session facade: the one entry point the view layer talks to

use crate::clock::{MonotonicClock, Watermarks};
use crate::config::{SessionConfig, SyncConfig};
use crate::dirty::DirtySet;
use crate::document::{ChangeSet, DocumentStore, Mutation};
use crate::error::{SyncError, SyncResult};
use crate::memory::MemoryHub;
use crate::persistence::{FlushCommand, SaveState, Synchronizer};
use crate::presence::{PeerSummary, PresenceRegistry};
use crate::transport::{BroadcastTransport, DurableStore, PresenceTransport};
use parking_lot::Mutex;
use protocol::{BroadcastMessage, ClientId, Document, SessionKey};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Where a document change came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Broadcast(ClientId),
    Durable,
    Load,
}

/// Fields changed in the local replica by one mutation or merge
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
    pub changes: ChangeSet,
}

/// Events a session emits to its observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    DocumentChanged(DocumentChange),
    SaveState(SaveState),
    /// Out-of-band error signal (failed load or flush)
    Error(SyncError),
    PresenceChanged,
}

/// The external collaborators a session is constructed with
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub broadcast: Arc<dyn BroadcastTransport>,
    pub presence: Arc<dyn PresenceTransport>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn DurableStore>,
        broadcast: Arc<dyn BroadcastTransport>,
        presence: Arc<dyn PresenceTransport>,
    ) -> Self {
        Collaborators {
            store,
            broadcast,
            presence,
        }
    }

    /// One object serving all three contracts
    pub fn from_shared<T>(transport: Arc<T>) -> Self
    where
        T: DurableStore + BroadcastTransport + PresenceTransport + 'static,
    {
        Collaborators {
            store: transport.clone(),
            broadcast: transport.clone(),
            presence: transport,
        }
    }

    pub fn in_memory(hub: &MemoryHub) -> Self {
        Self::from_shared(Arc::new(hub.clone()))
    }
}

/// Mutable per-session state, guarded by one short-held lock
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) client_id: ClientId,
    pub(crate) store: DocumentStore,
    pub(crate) dirty: DirtySet,
    pub(crate) watermarks: Watermarks,
    pub(crate) clock: MonotonicClock,

    /// Set while a flush is in flight
    pub(crate) syncing: bool,

    /// Document carried by the last successful flush
    pub(crate) last_flushed: Option<Document>,

    pub(crate) last_error: Option<SyncError>,
    pub(crate) save_state: SaveState,
}

impl SessionState {
    pub(crate) fn new(client_id: ClientId, initial: Document) -> Self {
        SessionState {
            client_id,
            store: DocumentStore::new(initial),
            dirty: DirtySet::new(),
            watermarks: Watermarks::new(),
            clock: MonotonicClock::new(),
            syncing: false,
            last_flushed: None,
            last_error: None,
            save_state: SaveState::Idle,
        }
    }

    /// Apply a local mutation: update the cache, mark changed fields dirty and
    /// build the broadcast for them. Nothing is built when nothing changed.
    pub(crate) fn apply_local(
        &mut self,
        mutation: Mutation,
    ) -> (ChangeSet, Option<BroadcastMessage>) {
        let changes = self.store.apply(mutation);
        if changes.is_empty() {
            return (changes, None);
        }

        self.dirty.mark_dirty(changes.keys().cloned());
        let message = BroadcastMessage {
            sender_id: self.client_id,
            timestamp: self.clock.next(),
            field_updates: changes.as_document().clone(),
        };
        (changes, Some(message))
    }

    /// Replace the replica with a freshly loaded durable document.
    pub(crate) fn load(&mut self, document: Document) -> ChangeSet {
        let changes = self.store.replace(document.clone());
        self.dirty.clear_all();
        self.last_flushed = Some(document);
        changes
    }
}

pub(crate) struct Shared {
    pub(crate) session: SessionKey,
    pub(crate) client_id: ClientId,
    pub(crate) sync: SyncConfig,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_changes(&self, origin: ChangeOrigin, changes: ChangeSet) {
        if !changes.is_empty() {
            self.emit(SessionEvent::DocumentChanged(DocumentChange { origin, changes }));
        }
    }

    pub(crate) fn record_error(&self, error: SyncError) {
        self.state.lock().last_error = Some(error.clone());
        self.emit(SessionEvent::Error(error));
    }
}

/// One client's live view of a session document
///
/// Created by [`SyncSession::join`], which opens the broadcast, presence and
/// durable subscriptions; [`SyncSession::leave`] flushes and releases them.
/// Dropping a session without leaving stops its background tasks.
pub struct SyncSession {
    shared: Arc<Shared>,
    presence: Arc<PresenceRegistry>,
    broadcast: Arc<dyn BroadcastTransport>,
    outbound: mpsc::UnboundedSender<BroadcastMessage>,
    flush: mpsc::UnboundedSender<FlushCommand>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSession {
    /// Join a session: subscribe to every channel, load the durable document
    /// (or start from the configured initial one) and announce presence.
    ///
    /// Subscription or load failures are not fatal; they are logged and the
    /// load failure is kept as the session's last error.
    pub async fn join(config: SessionConfig, collaborators: Collaborators) -> Self {
        let SessionConfig {
            session,
            client_id,
            display_name,
            initial_document,
            sync,
        } = config;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            session: session.clone(),
            client_id,
            sync,
            state: Mutex::new(SessionState::new(client_id, initial_document)),
            events,
        });

        // Subscribe before loading so a write landing in between is not missed
        let inbound = match collaborators.broadcast.subscribe(&session, client_id).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Broadcast subscribe failed for {}: {}", session, e);
                None
            }
        };
        let durable_changes = match collaborators.store.watch(&session).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Durable watch failed for {}: {}", session, e);
                None
            }
        };
        let presence_syncs = match collaborators.presence.subscribe(&session, client_id).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!("Presence subscribe failed for {}: {}", session, e);
                None
            }
        };

        match collaborators.store.select(&session).await {
            Ok(Some(document)) => {
                let changes = shared.state.lock().load(document);
                shared.emit_changes(ChangeOrigin::Load, changes);
            }
            Ok(None) => {
                tracing::debug!("No stored document for {}, using initial document", session);
            }
            Err(e) => {
                tracing::warn!("Loading {} failed: {}", session, e);
                shared.record_error(e.into());
            }
        }

        let presence = Arc::new(PresenceRegistry::new(
            session.clone(),
            client_id,
            display_name,
            collaborators.presence.clone(),
            shared.events.clone(),
        ));

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (flush, flush_rx) = mpsc::unbounded_channel();

        let mut tasks = vec![
            tokio::spawn(crate::broadcast::run_publisher(
                collaborators.broadcast.clone(),
                session.clone(),
                outbound_rx,
            )),
            tokio::spawn(
                Synchronizer::new(shared.clone(), collaborators.store.clone(), flush_rx).run(),
            ),
        ];
        if let Some(rx) = inbound {
            tasks.push(tokio::spawn(crate::broadcast::run_listener(shared.clone(), rx)));
        }
        if let Some(rx) = durable_changes {
            tasks.push(tokio::spawn(crate::reconcile::run_listener(shared.clone(), rx)));
        }
        if let Some(rx) = presence_syncs {
            tasks.push(tokio::spawn(crate::presence::run_listener(
                presence.clone(),
                shared.clone(),
                rx,
            )));
        }

        presence.announce().await;

        tracing::info!("Client {} joined session {}", client_id, session);

        SyncSession {
            shared,
            presence,
            broadcast: collaborators.broadcast,
            outbound,
            flush,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn session(&self) -> &SessionKey {
        &self.shared.session
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    /// Snapshot of the current local document
    pub fn get_document(&self) -> Document {
        self.shared.state.lock().store.document().clone()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.shared.state.lock().store.get(field).cloned()
    }

    /// The only way to change the document.
    ///
    /// The cache is updated before this returns. Changed fields are marked
    /// dirty, broadcast, and the debounce timer is re-armed; when nothing
    /// changed none of that happens.
    pub fn mutate(&self, mutation: impl Into<Mutation>) -> ChangeSet {
        let (changes, message) = self.shared.state.lock().apply_local(mutation.into());
        let Some(message) = message else {
            return changes;
        };

        tracing::debug!(
            "Local change to {:?} in {}",
            changes.keys().collect::<Vec<_>>(),
            self.shared.session
        );

        // Both receivers outlive the session unless it is being torn down
        let _ = self.outbound.send(message);
        let _ = self.flush.send(FlushCommand::Arm);

        self.shared.emit_changes(ChangeOrigin::Local, changes.clone());
        changes
    }

    pub fn set(&self, field: impl Into<String>, value: Value) -> ChangeSet {
        self.mutate(Mutation::set(field, value))
    }

    /// Prepend `entry` to a list field, keeping the newest `cap` entries.
    pub fn append_capped(&self, field: impl Into<String>, entry: Value, cap: usize) -> ChangeSet {
        self.mutate(Mutation::prepend_capped(field, entry, cap))
    }

    pub fn is_dirty(&self, field: &str) -> bool {
        self.shared.state.lock().dirty.is_dirty(field)
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        self.shared.state.lock().dirty.fields()
    }

    pub fn save_state(&self) -> SaveState {
        self.shared.state.lock().save_state
    }

    /// Most recent load or flush error, cleared by the next successful flush
    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.state.lock().last_error.clone()
    }

    /// Stream of document, save-state, error and presence events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Run `handler` for every document change until the session ends.
    pub fn on_document_change<F>(&self, mut handler: F)
    where
        F: FnMut(&DocumentChange) + Send + 'static,
    {
        let mut rx = self.shared.events.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::DocumentChanged(change)) => handler(&change),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Document change handler missed {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().push(task);
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub async fn begin_editing(&self, field: &str) {
        self.presence.begin_editing(field).await;
    }

    pub async fn stop_editing(&self, field: &str) {
        self.presence.stop_editing(field).await;
    }

    pub async fn update_current_view(&self, view: &str) {
        self.presence.update_current_view(view).await;
    }

    pub fn is_field_locked(&self, field: &str) -> bool {
        self.presence.is_field_locked(field)
    }

    pub fn get_field_editor(&self, field: &str) -> Option<PeerSummary> {
        self.presence.get_field_editor(field)
    }

    /// Flush pending edits now instead of waiting for the debounce.
    pub async fn flush_now(&self) -> SyncResult<()> {
        let (ack, done) = oneshot::channel();
        self.flush
            .send(FlushCommand::FlushNow(ack))
            .map_err(|_| SyncError::Closed)?;
        done.await.map_err(|_| SyncError::Closed)?
    }

    /// Flush pending edits, drop presence, close the broadcast channel and
    /// stop every background task. Returns the final flush result.
    pub async fn leave(self) -> SyncResult<()> {
        let result = self.flush_now().await;

        self.presence.leave().await;
        if let Err(e) = self
            .broadcast
            .close(&self.shared.session, self.shared.client_id)
            .await
        {
            tracing::debug!("Closing broadcast for {} failed: {}", self.shared.session, e);
        }

        self.stop_tasks();
        tracing::info!(
            "Client {} left session {}",
            self.shared.client_id,
            self.shared.session
        );
        result
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_local_builds_broadcast_for_changes_only() {
        let client = ClientId::new();
        let mut initial = Document::new();
        initial.insert("counter".to_string(), json!(1));
        let mut state = SessionState::new(client, initial);

        let (changes, message) = state.apply_local(Mutation::set("counter", json!(1)));
        assert!(changes.is_empty());
        assert!(message.is_none());
        assert!(state.dirty.is_empty());

        let (changes, message) = state.apply_local(Mutation::set("counter", json!(3)));
        let message = message.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(message.sender_id, client);
        assert_eq!(message.field_updates.get("counter"), Some(&json!(3)));
        assert!(state.dirty.is_dirty("counter"));
    }

    #[test]
    fn test_load_clears_dirty() {
        let mut state = SessionState::new(ClientId::new(), Document::new());
        state.apply_local(Mutation::set("journal", json!("draft")));

        let mut stored = Document::new();
        stored.insert("journal".to_string(), json!("saved"));
        let changes = state.load(stored.clone());

        assert!(changes.contains("journal"));
        assert!(state.dirty.is_empty());
        assert_eq!(state.last_flushed, Some(stored));
    }
}
