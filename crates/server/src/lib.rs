// Session sync relay: WebSocket fan-out plus durable document storage

pub mod database;
pub mod file_store;
pub mod server;
pub mod session;
pub mod storage;

pub use file_store::FileStore;
pub use server::{create_server, serve, ServerState};
pub use storage::Storage;
