//! Best-effort cursor mapping with time-bounded entries
//!
//! Resolved cursor ids are cached against their recorded ids and expire
//! after a fixed interval. A lookup that misses reports unresolved and the
//! caller proceeds without rewriting; that is acceptable when exact replay
//! fidelity is not required, e.g. monitoring.

use crate::cursors::CursorManager;
use crate::playback::format::RecordedOp;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default lifetime of a cached mapping
pub const DEFAULT_CURSOR_TTL: Duration = Duration::from_secs(600);

/// Sweep lazily once the map grows past this many entries
const SWEEP_THRESHOLD: usize = 4096;

struct TtlEntry {
    live_id: i64,
    expires_at: Instant,
}

/// TTL-cache cursor manager
pub struct TtlCursorManager {
    entries: Mutex<HashMap<i64, TtlEntry>>,
    ttl: Duration,
}

impl TtlCursorManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn sweep(entries: &mut HashMap<i64, TtlEntry>, now: Instant) {
        if entries.len() >= SWEEP_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }
}

impl Default for TtlCursorManager {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_TTL)
    }
}

#[async_trait]
impl CursorManager for TtlCursorManager {
    async fn get_cursor(&self, recorded_id: i64, _connection_num: u64) -> Option<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&recorded_id) {
            Some(entry) if entry.expires_at > now => Some(entry.live_id),
            Some(_) => {
                entries.remove(&recorded_id);
                trace!(recorded_id, "cursor mapping expired");
                None
            }
            None => None,
        }
    }

    fn set_cursor(&self, recorded_id: i64, live_id: i64) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, now);
        entries.insert(
            recorded_id,
            TtlEntry {
                live_id,
                expires_at: now + self.ttl,
            },
        );
    }

    fn mark_failed(&self, _op: &RecordedOp) {
        // nothing blocks on this manager, so failures need no signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get() {
        let manager = TtlCursorManager::default();
        manager.set_cursor(4567, 999);
        assert_eq!(manager.get_cursor(4567, 0).await, Some(999));
    }

    #[tokio::test]
    async fn test_miss_is_unresolved() {
        let manager = TtlCursorManager::default();
        assert_eq!(manager.get_cursor(1, 0).await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_unresolved() {
        let manager = TtlCursorManager::new(Duration::from_millis(0));
        manager.set_cursor(7, 8);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.get_cursor(7, 0).await, None);
    }

    #[tokio::test]
    async fn test_latest_mapping_wins() {
        let manager = TtlCursorManager::default();
        manager.set_cursor(7, 8);
        manager.set_cursor(7, 9);
        assert_eq!(manager.get_cursor(7, 0).await, Some(9));
    }
}
