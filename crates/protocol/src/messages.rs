// WebSocket message types for client <-> relay communication

use crate::model::{BroadcastMessage, ClientId, Document, PresenceRecord, SessionKey};
use serde::{Deserialize, Serialize};

// Messages sent from client to relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    // Join a session's broadcast, presence and document channels
    Join {
        session: SessionKey,
        client_id: ClientId,
    },

    // Leave the current session
    Leave,

    // Publish an ephemeral field update to the other members
    Publish { message: BroadcastMessage },

    // Replace this client's presence record
    Track { record: PresenceRecord },

    // Drop this client's presence record
    Untrack,

    // Read the durable document for the session
    Select { request_id: u64 },

    // Whole-document durable write for the session
    Upsert { request_id: u64, document: Document },

    // Heartbeat/ping
    Ping,
}

// Messages sent from relay to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    // Joined the session successfully
    Joined {
        session: SessionKey,
        client_id: ClientId,
    },

    // Field update published by another member
    Broadcast { message: BroadcastMessage },

    // Full current presence set, sent on every change
    PresenceSync { records: Vec<PresenceRecord> },

    // Durable document after a successful write by any member
    DocumentChanged { document: Document },

    // Reply to Select; None when the session has never been written
    Selected {
        request_id: u64,
        document: Option<Document>,
    },

    // Reply to Upsert
    Upserted { request_id: u64 },

    // Error message, correlated to a request when there is one
    Error {
        request_id: Option<u64>,
        message: String,
    },

    // Pong response to ping
    Pong,
}

impl ServerMessage {
    pub fn error(request_id: Option<u64>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            message: message.into(),
        }
    }
}
