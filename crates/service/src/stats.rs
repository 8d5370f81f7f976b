//! Stats document: totals plus a bounded ring of request
//! timestamps, mutated under a single mutex and persisted by a coalesced
//! background flusher. Grounded on the same dirty-bit/poll-loop
//! shape as `session_cache.rs`'s binding flusher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use acctrelay_core::storage::KEY_STATS;
use acctrelay_core::time::now_ts;
use acctrelay_core::Storage;

use crate::poll_loop::run_blocking_poll_loop;

/// Ring capacity for `recent_request_timestamps`: a bounded ring of
/// request timestamps"). Large enough for a rolling requests-per-minute
/// display without the document growing unbounded.
const TIMESTAMP_RING_CAP: usize = 2000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub started_at: i64,
    pub recent_request_timestamps: Vec<i64>,
}

pub struct StatsStore {
    snapshot: Mutex<StatsSnapshot>,
    dirty: AtomicBool,
}

impl StatsStore {
    pub fn new() -> Self {
        StatsStore {
            snapshot: Mutex::new(StatsSnapshot {
                started_at: now_ts(),
                ..Default::default()
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn load_from(storage: &Storage) -> Self {
        let store = StatsStore::new();
        if let Ok(Some(loaded)) = storage.get_json::<StatsSnapshot>(KEY_STATS) {
            let mut snapshot = store.snapshot.lock().expect("stats mutex poisoned");
            snapshot.total_requests = loaded.total_requests;
            snapshot.total_errors = loaded.total_errors;
            snapshot.recent_request_timestamps = loaded.recent_request_timestamps;
            // `started_at` is a process-lifetime fact, never carried over
            // from a prior run.
        }
        store
    }

    pub fn record_request(&self) {
        let mut snapshot = self.snapshot.lock().expect("stats mutex poisoned");
        snapshot.total_requests += 1;
        snapshot.recent_request_timestamps.push(now_ts());
        if snapshot.recent_request_timestamps.len() > TIMESTAMP_RING_CAP {
            let overflow = snapshot.recent_request_timestamps.len() - TIMESTAMP_RING_CAP;
            snapshot.recent_request_timestamps.drain(0..overflow);
        }
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        let mut snapshot = self.snapshot.lock().expect("stats mutex poisoned");
        snapshot.total_errors += 1;
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.lock().expect("stats mutex poisoned").clone()
    }

    fn flush(&self, storage: &Storage) -> Result<(), String> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.snapshot();
        storage.set_json(KEY_STATS, &snapshot).map_err(|e| e.to_string())
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        StatsStore::new()
    }
}

/// Stats are buffered in memory and flushed every 30s.
pub fn spawn_flusher(stats: Arc<StatsStore>, storage: Arc<Storage>, interval_secs: u64) {
    std::thread::spawn(move || {
        run_blocking_poll_loop(
            "stats_flush",
            Duration::from_secs(interval_secs),
            Duration::from_secs(2),
            Duration::from_secs(300),
            || stats.flush(&storage),
            |_| true,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_total_and_ring() {
        let store = StatsStore::new();
        store.record_request();
        store.record_request();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.recent_request_timestamps.len(), 2);
    }

    #[test]
    fn ring_caps_at_capacity() {
        let store = StatsStore::new();
        for _ in 0..(TIMESTAMP_RING_CAP + 10) {
            store.record_request();
        }
        assert_eq!(store.snapshot().recent_request_timestamps.len(), TIMESTAMP_RING_CAP);
    }

    #[test]
    fn flush_clears_dirty_bit_and_persists() {
        let storage = Storage::open_in_memory().expect("storage");
        let store = StatsStore::new();
        store.record_request();
        store.record_error();
        store.flush(&storage).expect("flush");
        let loaded: StatsSnapshot = storage.get_json(KEY_STATS).expect("get").expect("present");
        assert_eq!(loaded.total_requests, 1);
        assert_eq!(loaded.total_errors, 1);
    }
}
