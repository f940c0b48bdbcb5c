// Session document synchronization engine
//
// Keeps one shared JSON document consistent across clients: local mutations
// apply instantly, go out on an ephemeral broadcast, and reach the durable
// store after a debounce. Remote updates never overwrite fields that still
// carry unconfirmed local edits.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod dirty;
pub mod document;
pub mod error;
pub mod memory;
pub mod persistence;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod transport;

pub use {
    config::{SessionConfig, SyncConfig},
    dirty::DirtySet,
    document::{ChangeSet, DocumentStore, Mutation},
    error::{StoreError, SyncError, SyncResult, TransportError},
    memory::MemoryHub,
    persistence::SaveState,
    presence::{PeerSummary, PresenceRegistry},
    session::{ChangeOrigin, Collaborators, DocumentChange, SessionEvent, SyncSession},
    transport::{BroadcastTransport, DurableStore, PresenceTransport},
};

pub use protocol::{BroadcastMessage, ClientId, Document, PresenceRecord, SessionKey};
