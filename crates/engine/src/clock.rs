// Send-side timestamps and receive-side staleness watermarks

use chrono::Utc;
use protocol::ClientId;
use std::collections::HashMap;

/// Millisecond wall clock that never repeats or goes backwards
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> i64 {
        self.advance(Utc::now().timestamp_millis())
    }

    fn advance(&mut self, now: i64) -> i64 {
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// Last admitted broadcast timestamp per (sender, field).
///
/// Tracking per pair means a slow clock on one sender can't cause updates
/// from another sender, or to another field, to be dropped.
#[derive(Debug, Default)]
pub struct Watermarks {
    last: HashMap<(ClientId, String), i64>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `timestamp` if it is strictly newer than anything seen from
    /// `sender` for `field`, recording it.
    pub fn admit(&mut self, sender: ClientId, field: &str, timestamp: i64) -> bool {
        let key = (sender, field.to_string());
        match self.last.get(&key) {
            Some(&seen) if timestamp <= seen => false,
            _ => {
                self.last.insert(key, timestamp);
                true
            }
        }
    }

    /// Forget everything recorded for a sender.
    pub fn forget(&mut self, sender: &ClientId) {
        self.last.retain(|(s, _), _| s != sender);
    }
}
