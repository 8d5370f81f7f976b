//! Auto-refresh loop: a 30 min tick running recycle,
//! replenish, and refresh phases in order. Built on the same
//! `crossbeam-channel` FIFO primitive as the task queue -- a `tick()`
//! channel drives the periodic schedule, a second channel lets `resume()`
//! force an immediate extra tick without waiting out the interval.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acctrelay_core::model::{Account, TaskKind};
use acctrelay_core::time::{now_ts, parse_account_tz};
use acctrelay_core::storage::KEY_ACCOUNTS;
use acctrelay_core::Storage;

use crate::account::{AccountPool, CooldownReason};
use crate::settings::Settings;
use crate::subprocess::SubprocessRequest;
use crate::task_queue::{TaskSupervisor, WorkItem};

/// Runtime-only pause flag, never persisted. Resuming nudges the
/// loop for an immediate tick.
pub struct RefreshController {
    paused: AtomicBool,
    nudge_tx: crossbeam_channel::Sender<()>,
}

impl RefreshController {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.nudge_tx.send(());
    }
}

pub(crate) fn subprocess_request_for(account: &Account, worker_engine: &str) -> SubprocessRequest {
    SubprocessRequest {
        // The subprocess protocol names this action "login" (re-
        // authenticate an existing account), distinct from the `register`
        // task kind that mints a brand new one.
        action: "login",
        email: Some(account.account_id.clone()),
        browser_engine: worker_engine.to_string(),
        headless: true,
        proxy: None,
        user_agent: None,
        mail_provider: account.mail.tag().to_string(),
        mail_config: serde_json::to_value(&account.mail).unwrap_or(serde_json::Value::Null),
        domain: None,
    }
}

pub(crate) fn register_request_template(worker_engine: &str) -> SubprocessRequest {
    SubprocessRequest {
        action: "register",
        email: None,
        browser_engine: worker_engine.to_string(),
        headless: true,
        proxy: None,
        user_agent: None,
        mail_provider: "gptmail".to_string(),
        mail_config: serde_json::json!({}),
        domain: None,
    }
}

/// Drops accounts whose lifetime ends within the recycle
/// window and which aren't presently rate-limited (a rate-limited account
/// might still recover before it actually expires).
fn recycle_phase(pool: &AccountPool, storage: &Storage, window_secs: i64) -> usize {
    let now = now_ts();
    let states = pool.all();
    let mut kept = Vec::with_capacity(states.len());
    let mut dropped = 0usize;
    for state in &states {
        let account = state.snapshot();
        let expiring_soon = account
            .account_expires_at
            .map(|deadline| deadline - now <= window_secs)
            .unwrap_or(false);
        let (_, reason) = state.get_cooldown_info();
        let rate_limited = matches!(reason, Some(CooldownReason::RateLimit));
        if expiring_soon && !rate_limited {
            dropped += 1;
            log::info!(
                "event=account_recycled account_id={} account_expires_at={:?}",
                account.account_id,
                account.account_expires_at
            );
        } else {
            kept.push(account);
        }
    }
    if dropped > 0 {
        pool.reload(kept.clone());
        if let Err(err) = storage.set_json(KEY_ACCOUNTS, &kept) {
            log::error!("event=account_persist_failed where=recycle error={err}");
        }
    }
    dropped
}

/// Counts accounts that are neither disabled nor within 24h
/// of expiry; enqueue a register task for the shortfall against
/// `min_pool_size`.
fn replenish_phase(
    pool: &AccountPool,
    supervisor: &Arc<TaskSupervisor>,
    min_pool_size: usize,
    recycle_window_secs: i64,
    worker_engine: &str,
) -> Option<String> {
    let now = now_ts();
    let available = pool
        .all()
        .iter()
        .filter(|state| {
            let account = state.snapshot();
            !account.disabled
                && account
                    .account_expires_at
                    .map(|deadline| deadline - now > recycle_window_secs)
                    .unwrap_or(true)
        })
        .count();

    if available >= min_pool_size {
        return None;
    }
    let deficit = min_pool_size - available;
    log::info!("event=account_replenish_triggered available={available} min_pool_size={min_pool_size} deficit={deficit}");
    let engine = worker_engine.to_string();
    Some(supervisor.submit_register(deficit, move || register_request_template(&engine)))
}

/// Accounts whose session expires within the refresh window,
/// deduped against any account already named in a pending/running refresh
/// task, enqueued as one combined refresh task.
fn refresh_phase(
    pool: &AccountPool,
    supervisor: &Arc<TaskSupervisor>,
    window_secs: i64,
    worker_engine: &str,
    accounts_in_flight: &Mutex<HashSet<String>>,
) -> Option<String> {
    let now = now_ts();
    let in_flight = accounts_in_flight.lock().expect("in-flight set poisoned");
    if let Some(current) = supervisor.store().current(TaskKind::Refresh) {
        if !current.status.is_terminal() {
            log::info!("event=refresh_phase_skip reason=refresh_already_running task_id={}", current.task_id);
            return None;
        }
    }

    let items: Vec<WorkItem> = pool
        .all()
        .iter()
        .filter_map(|state| {
            let account = state.snapshot();
            if account.disabled {
                return None;
            }
            if in_flight.contains(&account.account_id) {
                return None;
            }
            if account.expires_at - now > window_secs {
                return None;
            }
            Some(WorkItem {
                account_id: Some(account.account_id.clone()),
                request: subprocess_request_for(&account, worker_engine),
            })
        })
        .collect();
    drop(in_flight);

    if items.is_empty() {
        return None;
    }
    let mut guard = accounts_in_flight.lock().expect("in-flight set poisoned");
    for item in &items {
        if let Some(id) = &item.account_id {
            guard.insert(id.clone());
        }
    }
    drop(guard);
    log::info!("event=refresh_phase_enqueued account_count={}", items.len());
    Some(supervisor.submit_refresh(items))
}

/// Merges newly-registered/refreshed account configs (raw, uncompacted --
/// see `task_queue::TaskSupervisor::on_register_complete`) into the pool
/// and persists the result.
fn merge_account_configs(pool: &AccountPool, storage: &Storage, configs: Vec<serde_json::Value>) {
    if configs.is_empty() {
        return;
    }
    let mut by_id: std::collections::HashMap<String, Account> =
        pool.all().iter().map(|s| (s.account_id(), s.snapshot())).collect();

    for config in configs {
        let Some(account_id) = config.get("id").and_then(|v| v.as_str()) else {
            log::warn!("event=account_merge_skip reason=missing_id");
            continue;
        };
        let expires_at = config
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(parse_account_tz)
            .unwrap_or_else(|| now_ts() + 300);
        let existing_mail = by_id.get(account_id).map(|a| a.mail.clone());
        let account = Account {
            account_id: account_id.to_string(),
            csesidx: config.get("csesidx").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            config_id: config.get("config_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            secure_c_ses: config.get("secure_c_ses").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            host_c_oses: config.get("host_c_oses").and_then(|v| v.as_str()).map(str::to_string),
            expires_at,
            account_expires_at: Some(now_ts() + 30 * 24 * 3600),
            mail: existing_mail.unwrap_or(acctrelay_core::model::MailProviderConfig::Gptmail {
                base_url: String::new(),
                api_key: String::new(),
            }),
            disabled: false,
        };
        by_id.insert(account_id.to_string(), account);
    }

    let merged: Vec<Account> = by_id.into_values().collect();
    pool.reload(merged.clone());
    if let Err(err) = storage.set_json(KEY_ACCOUNTS, &merged) {
        log::error!("event=account_persist_failed where=merge error={err}");
    }
}

/// Spawns the refresh-loop thread and returns a handle for admin pause/resume.
/// `worker_engine` is passed straight through into submitted
/// subprocess requests (e.g. `"chromium"`).
pub fn spawn_refresh_loop(
    pool: Arc<AccountPool>,
    storage: Arc<Storage>,
    settings: Arc<Mutex<Settings>>,
    supervisor: Arc<TaskSupervisor>,
    worker_engine: String,
) -> Arc<RefreshController> {
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded::<()>();
    let controller = Arc::new(RefreshController {
        paused: AtomicBool::new(false),
        nudge_tx,
    });

    let accounts_in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    {
        let pool = pool.clone();
        let storage = storage.clone();
        supervisor.on_register_complete(move |configs| {
            merge_account_configs(&pool, &storage, configs);
        });
    }
    {
        let pool = pool.clone();
        let storage = storage.clone();
        let accounts_in_flight = accounts_in_flight.clone();
        supervisor.on_refresh_complete(move |configs| {
            merge_account_configs(&pool, &storage, configs);
            accounts_in_flight.lock().expect("in-flight set poisoned").clear();
        });
    }

    {
        let controller = controller.clone();
        std::thread::spawn(move || {
            let tick_secs = settings.lock().expect("settings mutex poisoned").session.auto_refresh_tick_secs;
            let ticker = crossbeam_channel::tick(Duration::from_secs(tick_secs.max(1)));
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {}
                    recv(nudge_rx) -> _ => {}
                }

                if controller.is_paused() {
                    log::debug!("event=refresh_tick_skipped reason=paused");
                    continue;
                }

                let snapshot = settings.lock().expect("settings mutex poisoned").session.clone();
                let recycled = recycle_phase(&pool, &storage, snapshot.account_recycle_window_secs);
                let register_task = replenish_phase(
                    &pool,
                    &supervisor,
                    snapshot.min_pool_size,
                    snapshot.account_recycle_window_secs,
                    &worker_engine,
                );
                let refresh_task = if controller.is_paused() {
                    None
                } else {
                    refresh_phase(
                        &pool,
                        &supervisor,
                        snapshot.auto_refresh_window_secs,
                        &worker_engine,
                        &accounts_in_flight,
                    )
                };

                log::info!(
                    "event=refresh_tick_complete recycled={recycled} register_task={:?} refresh_task={:?}",
                    register_task,
                    refresh_task
                );
            }
        });
    }

    controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use acctrelay_core::model::MailProviderConfig;

    fn sample_account(id: &str, account_expires_at: i64, expires_at: i64) -> Account {
        Account {
            account_id: id.to_string(),
            csesidx: "c".to_string(),
            config_id: "cfg".to_string(),
            secure_c_ses: "s".to_string(),
            host_c_oses: Some("h".to_string()),
            expires_at,
            account_expires_at: Some(account_expires_at),
            mail: MailProviderConfig::Gptmail {
                base_url: "https://mail.example".to_string(),
                api_key: "key".to_string(),
            },
            disabled: false,
        }
    }

    #[test]
    fn recycle_drops_accounts_near_expiry_and_not_cooling_down() {
        let now = now_ts();
        let pool = AccountPool::new(vec![
            sample_account("soon", now + 60, now + 3600),
            sample_account("later", now + 100_000, now + 3600),
        ]);
        let storage = Storage::open_in_memory().expect("storage");
        let dropped = recycle_phase(&pool, &storage, 24 * 3600);
        assert_eq!(dropped, 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.get_by_id("later").is_some());
        assert!(pool.get_by_id("soon").is_none());
    }

    #[test]
    fn replenish_is_skipped_when_pool_is_large_enough() {
        let now = now_ts();
        let pool = AccountPool::new(vec![sample_account("a", now + 100_000, now + 3600)]);
        let supervisor = TaskSupervisor::new(crate::task_queue::TaskQueueConfig {
            worker_binary: "/nonexistent/acctrelay-browser-worker".to_string(),
            subprocess_timeout: Duration::from_secs(5),
        });
        let task = replenish_phase(&pool, &supervisor, 1, 24 * 3600, "chromium");
        assert!(task.is_none());
    }

    #[test]
    fn replenish_enqueues_deficit_when_pool_is_small() {
        let now = now_ts();
        let pool = AccountPool::new(vec![sample_account("a", now + 100_000, now + 3600)]);
        let supervisor = TaskSupervisor::new(crate::task_queue::TaskQueueConfig {
            worker_binary: "/nonexistent/acctrelay-browser-worker".to_string(),
            subprocess_timeout: Duration::from_secs(5),
        });
        let task = replenish_phase(&pool, &supervisor, 5, 24 * 3600, "chromium");
        assert!(task.is_some());
    }
}
