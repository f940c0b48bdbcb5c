// Shared data model and wire messages for session document sync

pub mod messages;
pub mod model;

pub use {
    messages::{ClientMessage, ServerMessage},
    model::{BroadcastMessage, ClientId, Document, PresenceRecord, SessionKey, DEFAULT_VIEW},
};
