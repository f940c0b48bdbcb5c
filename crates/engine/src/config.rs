// Engine and per-session configuration

use protocol::{ClientId, Document, SessionKey};
use std::time::Duration;

const DEFAULT_DEBOUNCE_MS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs for the durable synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last local mutation before a flush
    pub debounce: Duration,

    /// Retries after a failed flush before giving up until the next mutation
    pub max_retries: u32,

    /// Retry `n` waits `retry_backoff * n`
    pub retry_backoff: Duration,

    /// Upper bound for one request/reply round trip on remote transports
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SYNC_DEBOUNCE_MS`, `SYNC_MAX_RETRIES` and
    /// `SYNC_RETRY_BACKOFF_MS`. Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = SyncConfig::default();

        if let Some(ms) = env_number::<u64>("SYNC_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(retries) = env_number::<u32>("SYNC_MAX_RETRIES") {
            config.max_retries = retries;
        }
        if let Some(ms) = env_number::<u64>("SYNC_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(ms);
        }

        config
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

/// Everything a client needs to join one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session: SessionKey,
    pub client_id: ClientId,
    pub display_name: String,

    /// Document used when the durable store has nothing for the session yet
    pub initial_document: Document,

    pub sync: SyncConfig,
}

impl SessionConfig {
    pub fn new(session: impl Into<SessionKey>) -> Self {
        SessionConfig {
            session: session.into(),
            client_id: ClientId::new(),
            display_name: "Anonymous".to_string(),
            initial_document: Document::new(),
            sync: SyncConfig::default(),
        }
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_initial_document(mut self, document: Document) -> Self {
        self.initial_document = document;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
