//! Error types for the sync engine

use thiserror::Error;

/// Failures of the ephemeral broadcast or presence channel.
///
/// These are never fatal: callers log and drop them.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Not joined to session {0}")]
    WrongSession(String),

    #[error("Request timed out")]
    Timeout,
}

/// Failures of the durable store contract (select / upsert / watch)
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Durable store failure: {0}")]
    Backend(String),

    #[error("Durable store request timed out")]
    Timeout,

    #[error("Durable store unreachable: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced on a session's error channel
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session already left")]
    Closed,
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Backend("disk full".to_string());
        assert!(err.to_string().contains("Durable store failure"));
        assert!(err.to_string().contains("disk full"));

        let err: SyncError = err.into();
        assert!(err.to_string().contains("disk full"));

        let err: StoreError = TransportError::Closed.into();
        assert!(err.to_string().contains("Channel closed"));

        let err = TransportError::WrongSession("ABCD".to_string());
        assert!(format!("{}", err).contains("ABCD"));
    }
}
