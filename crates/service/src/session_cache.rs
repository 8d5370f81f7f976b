//! Session-binding cache: `chat_id -> (account_id, session_id?,
//! created_at)`, TTL + LRU eviction, background dirty-bit flush to the
//! `session_bindings` KV key. The flush loop reuses the shared periodic
//! poll-loop utility (see `poll_loop.rs`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acctrelay_core::model::SessionBinding;
use acctrelay_core::storage::KEY_SESSION_BINDINGS;
use acctrelay_core::time::now_ts;
use acctrelay_core::Storage;

use crate::poll_loop::run_blocking_poll_loop;

pub struct SessionBindingCache {
    bindings: Mutex<HashMap<String, SessionBinding>>,
    dirty: AtomicBool,
    ttl_secs: i64,
    max_entries: usize,
}

impl SessionBindingCache {
    pub fn new(ttl_secs: i64, max_entries: usize) -> Self {
        SessionBindingCache {
            bindings: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            ttl_secs,
            max_entries,
        }
    }

    pub fn load_from(storage: &Storage, ttl_secs: i64, max_entries: usize) -> Self {
        let cache = SessionBindingCache::new(ttl_secs, max_entries);
        if let Ok(Some(loaded)) = storage.get_json::<HashMap<String, SessionBinding>>(KEY_SESSION_BINDINGS) {
            *cache.bindings.lock().expect("bindings mutex poisoned") = loaded;
        }
        cache
    }

    /// Lazily evicts entries past `binding_ttl`.
    pub fn get(&self, chat_id: &str) -> Option<SessionBinding> {
        let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
        let binding = bindings.get(chat_id)?.clone();
        if now_ts() - binding.created_at > self.ttl_secs {
            bindings.remove(chat_id);
            self.dirty.store(true, Ordering::SeqCst);
            return None;
        }
        Some(binding)
    }

    /// Preserves the earliest `created_at`; keeps a prior
    /// `session_id` when the caller sets a new account without a new
    /// session.
    pub fn set(&self, chat_id: &str, account_id: &str, session_id: Option<String>) {
        let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
        let now = now_ts();
        let entry = bindings.entry(chat_id.to_string()).or_insert_with(|| SessionBinding {
            account_id: account_id.to_string(),
            session_id: session_id.clone(),
            created_at: now,
        });
        entry.account_id = account_id.to_string();
        if session_id.is_some() {
            entry.session_id = session_id;
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.evict_if_over_capacity(&mut bindings);
    }

    pub fn remove(&self, chat_id: &str) {
        let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
        if bindings.remove(chat_id).is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Keeps the account, clears `session_id`.
    pub fn reset_session(&self, chat_id: &str) {
        let mut bindings = self.bindings.lock().expect("bindings mutex poisoned");
        if let Some(binding) = bindings.get_mut(chat_id) {
            binding.session_id = None;
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn evict_if_over_capacity(&self, bindings: &mut HashMap<String, SessionBinding>) {
        if bindings.len() <= self.max_entries {
            return;
        }
        let evict_count = bindings.len() / 10;
        let mut by_age: Vec<(String, i64)> = bindings
            .iter()
            .map(|(k, v)| (k.clone(), v.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);
        for (key, _) in by_age.into_iter().take(evict_count.max(1)) {
            bindings.remove(&key);
        }
    }

    fn flush(&self, storage: &Storage) -> Result<(), String> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.bindings.lock().expect("bindings mutex poisoned").clone();
        storage
            .set_json(KEY_SESSION_BINDINGS, &snapshot)
            .map_err(|e| e.to_string())
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().expect("bindings mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the background flusher thread (default 60s interval).
pub fn spawn_flusher(cache: Arc<SessionBindingCache>, storage: Arc<Storage>, interval_secs: u64) {
    std::thread::spawn(move || {
        run_blocking_poll_loop(
            "session_binding_flush",
            Duration::from_secs(interval_secs),
            Duration::from_secs(2),
            Duration::from_secs(300),
            || cache.flush(&storage),
            |_| true,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let cache = SessionBindingCache::new(3600, 10_000);
        cache.set("chat-1", "acc-a", Some("sess-1".to_string()));
        let binding = cache.get("chat-1").expect("present");
        assert_eq!(binding.account_id, "acc-a");
        assert_eq!(binding.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn remove_then_get_returns_none() {
        let cache = SessionBindingCache::new(3600, 10_000);
        cache.set("chat-1", "acc-a", None);
        cache.remove("chat-1");
        assert!(cache.get("chat-1").is_none());
    }

    #[test]
    fn set_preserves_earliest_created_at_and_prior_session_when_unset() {
        let cache = SessionBindingCache::new(3600, 10_000);
        cache.set("chat-1", "acc-a", Some("sess-1".to_string()));
        let first_created_at = cache.get("chat-1").unwrap().created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.set("chat-1", "acc-b", None);
        let binding = cache.get("chat-1").unwrap();
        assert_eq!(binding.account_id, "acc-b");
        assert_eq!(binding.session_id.as_deref(), Some("sess-1"));
        assert_eq!(binding.created_at, first_created_at);
    }

    #[test]
    fn ttl_expiry_evicts_on_read() {
        let cache = SessionBindingCache::new(0, 10_000);
        cache.set("chat-1", "acc-a", None);
        std::thread::sleep(std::time::Duration::from_secs(1));
        assert!(cache.get("chat-1").is_none());
    }

    #[test]
    fn reset_session_keeps_account_clears_session() {
        let cache = SessionBindingCache::new(3600, 10_000);
        cache.set("chat-1", "acc-a", Some("sess-1".to_string()));
        cache.reset_session("chat-1");
        let binding = cache.get("chat-1").unwrap();
        assert_eq!(binding.account_id, "acc-a");
        assert_eq!(binding.session_id, None);
    }

    #[test]
    fn lru_eviction_removes_oldest_tenth_over_capacity() {
        let cache = SessionBindingCache::new(3600, 10);
        for i in 0..11 {
            cache.set(&format!("chat-{i}"), "acc-a", None);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(cache.len() <= 11);
        assert!(cache.get("chat-0").is_none());
    }
}
