// Session document, identities, broadcast and presence records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// The shared session document: top-level field name -> JSON value.
///
/// Top-level keys are the unit of merge; nested values are always replaced
/// wholesale.
pub type Document = Map<String, Value>;

/// View a freshly joined client reports until it says otherwise.
pub const DEFAULT_VIEW: &str = "dashboard";

const MAX_SESSION_KEY_LEN: usize = 64;

/// Room code addressing exactly one document and one presence set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        SessionKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Room codes are 1-64 ASCII letters, digits, `-` or `_`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_SESSION_KEY_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// Name of the ephemeral broadcast channel for this session.
    pub fn broadcast_topic(&self) -> String {
        format!("room:{}", self.0)
    }

    /// Name of the presence channel for this session.
    pub fn presence_topic(&self) -> String {
        format!("presence:{}", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(key: &str) -> Self {
        SessionKey::new(key)
    }
}

impl From<String> for SessionKey {
    fn from(key: String) -> Self {
        SessionKey(key)
    }
}

/// Identity of one connected client, stable for the lifetime of its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Fire-and-forget field update published on the session's ephemeral channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub sender_id: ClientId,
    /// Sender's wall-clock send time in milliseconds since the epoch
    pub timestamp: i64,
    pub field_updates: Document,
}

/// What one client is currently doing, republished wholesale on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub display_name: String,
    pub editing_fields: BTreeSet<String>,
    pub current_view: String,
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(client_id: ClientId, display_name: impl Into<String>) -> Self {
        PresenceRecord {
            client_id,
            display_name: display_name.into(),
            editing_fields: BTreeSet::new(),
            current_view: DEFAULT_VIEW.to_string(),
            last_seen_at: Utc::now(),
        }
    }

    pub fn is_editing(&self, field: &str) -> bool {
        self.editing_fields.contains(field)
    }

    /// Bump `last_seen_at` before a republish.
    pub fn touch(&mut self) {
        self.last_seen_at = Utc::now();
    }
}
