// Presence and soft-lock registry
//
// Each client owns one presence record and republishes it wholesale whenever
// it starts or stops editing a field or changes view. Locks are advisory: the
// registry only answers "is someone else editing this?", it never blocks a
// write.

use crate::session::{SessionEvent, Shared};
use crate::transport::PresenceTransport;
use parking_lot::Mutex;
use protocol::{ClientId, PresenceRecord, SessionKey};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Who another client is, for "locked by ..." messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub client_id: ClientId,
    pub display_name: String,
}

impl From<&PresenceRecord> for PeerSummary {
    fn from(record: &PresenceRecord) -> Self {
        PeerSummary {
            client_id: record.client_id,
            display_name: record.display_name.clone(),
        }
    }
}

pub struct PresenceRegistry {
    session: SessionKey,
    local: Mutex<PresenceRecord>,

    /// Records from the latest presence sync, this client's included
    online: Mutex<Vec<PresenceRecord>>,

    transport: Arc<dyn PresenceTransport>,
    events: broadcast::Sender<SessionEvent>,
}

impl PresenceRegistry {
    pub(crate) fn new(
        session: SessionKey,
        client_id: ClientId,
        display_name: String,
        transport: Arc<dyn PresenceTransport>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        PresenceRegistry {
            session,
            local: Mutex::new(PresenceRecord::new(client_id, display_name)),
            online: Mutex::new(Vec::new()),
            transport,
            events,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.local.lock().client_id
    }

    /// This client's own record as last published
    pub fn local_record(&self) -> PresenceRecord {
        self.local.lock().clone()
    }

    pub async fn begin_editing(&self, field: &str) {
        if field.is_empty() {
            return;
        }
        self.update_local(|record| {
            record.editing_fields.insert(field.to_string());
        })
        .await;
    }

    pub async fn stop_editing(&self, field: &str) {
        if field.is_empty() {
            return;
        }
        self.update_local(|record| {
            record.editing_fields.remove(field);
        })
        .await;
    }

    pub async fn update_current_view(&self, view: &str) {
        if view.is_empty() {
            return;
        }
        self.update_local(|record| record.current_view = view.to_string()).await;
    }

    /// True if some other client's last-known record lists `field`.
    pub fn is_field_locked(&self, field: &str) -> bool {
        self.get_field_editor(field).is_some()
    }

    pub fn get_field_editor(&self, field: &str) -> Option<PeerSummary> {
        let me = self.client_id();
        self.online
            .lock()
            .iter()
            .find(|record| record.client_id != me && record.is_editing(field))
            .map(PeerSummary::from)
    }

    /// Everyone in the latest presence sync
    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.online.lock().clone()
    }

    /// Other clients currently on `view`
    pub fn users_in_view(&self, view: &str) -> Vec<PeerSummary> {
        let me = self.client_id();
        self.online
            .lock()
            .iter()
            .filter(|record| record.client_id != me && record.current_view == view)
            .map(PeerSummary::from)
            .collect()
    }

    /// Publish the local record as it stands.
    pub(crate) async fn announce(&self) {
        let record = {
            let mut local = self.local.lock();
            local.touch();
            local.clone()
        };

        if let Err(e) = self.transport.track(&self.session, record).await {
            tracing::debug!("Presence update on {} dropped: {}", self.session.presence_topic(), e);
        }
    }

    pub(crate) async fn leave(&self) {
        let client_id = self.client_id();
        if let Err(e) = self.transport.untrack(&self.session, client_id).await {
            tracing::debug!("Presence untrack on {} failed: {}", self.session, e);
        }
        self.online.lock().clear();
    }

    /// Replace the known record set with a presence sync.
    ///
    /// Returns the clients that were online before and are gone now.
    pub(crate) fn apply_sync(&self, records: Vec<PresenceRecord>) -> Vec<ClientId> {
        let present: HashSet<ClientId> = records.iter().map(|r| r.client_id).collect();
        let mut online = self.online.lock();
        let departed = online
            .iter()
            .map(|r| r.client_id)
            .filter(|id| !present.contains(id))
            .collect();
        *online = records;
        drop(online);

        let _ = self.events.send(SessionEvent::PresenceChanged);
        departed
    }

    async fn update_local<F>(&self, change: F)
    where
        F: FnOnce(&mut PresenceRecord),
    {
        change(&mut *self.local.lock());
        self.announce().await;
    }
}

/// Track presence syncs until the channel closes.
///
/// Broadcast watermarks of departed clients are dropped along with them.
pub(crate) async fn run_listener(
    registry: Arc<PresenceRegistry>,
    shared: Arc<Shared>,
    mut syncs: mpsc::UnboundedReceiver<Vec<PresenceRecord>>,
) {
    while let Some(records) = syncs.recv().await {
        let departed = registry.apply_sync(records);
        if departed.is_empty() {
            continue;
        }

        let mut state = shared.state.lock();
        for client in &departed {
            tracing::debug!("Client {} left {}", client, shared.session);
            state.watermarks.forget(client);
        }
    }
}
