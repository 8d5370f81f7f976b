//! Account state machine and account pool.
//!
//! One `AccountState` per account holds the "never persisted" runtime
//! fields alongside a clone of the persisted `Account` document.
//! The quota-cooldown table uses reason-keyed cooldown durations, a "keep
//! the later deadline" merge rule, and periodic sweep of expired entries,
//! generalized here from one global cooldown to the `{text, images,
//! videos}` quota classes this upstream requires, plus the account's own
//! error-count/disable state tracked alongside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use acctrelay_core::model::{Account, QuotaClass};
use acctrelay_core::time::now_ts;

use crate::error::GatewayError;
use crate::jwt_minter::JwtCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    None,
    RateLimit,
    ErrorDisable,
}

#[derive(Default)]
struct AccountRuntime {
    is_available: bool,
    error_count: u32,
    last_cooldown_time: i64,
    cooldown_reason: Option<CooldownReason>,
    quota_cooldowns: HashMap<QuotaClass, i64>,
    session_usage_count: u64,
    conversation_count: u64,
}

impl AccountRuntime {
    fn fresh() -> Self {
        AccountRuntime {
            is_available: true,
            ..Default::default()
        }
    }
}

pub struct AccountState {
    pub account: Mutex<Account>,
    runtime: Mutex<AccountRuntime>,
    pub jwt: JwtCache,
}

impl AccountState {
    pub fn new(account: Account) -> Self {
        AccountState {
            account: Mutex::new(account),
            runtime: Mutex::new(AccountRuntime::fresh()),
            jwt: JwtCache::default(),
        }
    }

    pub fn account_id(&self) -> String {
        self.account.lock().expect("account mutex poisoned").account_id.clone()
    }

    pub fn snapshot(&self) -> Account {
        self.account.lock().expect("account mutex poisoned").clone()
    }

    /// Available, not in global cooldown, not disabled.
    pub fn should_retry(&self) -> bool {
        let account = self.account.lock().expect("account mutex poisoned");
        if account.disabled {
            return false;
        }
        let runtime = self.runtime.lock().expect("runtime mutex poisoned");
        if !runtime.is_available {
            return false;
        }
        let now = now_ts();
        match runtime.cooldown_reason {
            Some(CooldownReason::RateLimit) => runtime.last_cooldown_time <= now,
            _ => true,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        let account = self.account.lock().expect("account mutex poisoned");
        account.expires_at <= now_ts()
    }

    pub fn is_quota_available(&self, class: QuotaClass) -> bool {
        let runtime = self.runtime.lock().expect("runtime mutex poisoned");
        let now = now_ts();
        runtime
            .quota_cooldowns
            .get(&class)
            .map(|deadline| now >= *deadline)
            .unwrap_or(true)
    }

    pub fn get_cooldown_info(&self) -> (i64, Option<CooldownReason>) {
        let runtime = self.runtime.lock().expect("runtime mutex poisoned");
        let now = now_ts();
        let seconds_left = (runtime.last_cooldown_time - now).max(0);
        (seconds_left, runtime.cooldown_reason)
    }

    pub fn get_quota_status(&self) -> HashMap<QuotaClass, i64> {
        let runtime = self.runtime.lock().expect("runtime mutex poisoned");
        let now = now_ts();
        runtime
            .quota_cooldowns
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(class, deadline)| (*class, *deadline - now))
            .collect()
    }

    /// Status-specific handling for HTTP responses / in-band errors.
    pub fn handle_http_error(
        &self,
        status: u16,
        body_mentions_resource_exhausted: bool,
        quota_class: QuotaClass,
        rate_limit_cooldown_secs: i64,
        account_failure_threshold: u32,
    ) {
        let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
        let now = now_ts();
        match status {
            429 => {
                if body_mentions_resource_exhausted
                    || matches!(quota_class, QuotaClass::Images | QuotaClass::Videos)
                {
                    let deadline = now + rate_limit_cooldown_secs;
                    runtime
                        .quota_cooldowns
                        .entry(quota_class)
                        .and_modify(|d| *d = (*d).max(deadline))
                        .or_insert(deadline);
                } else {
                    runtime.last_cooldown_time = runtime.last_cooldown_time.max(now + rate_limit_cooldown_secs);
                    runtime.cooldown_reason = Some(CooldownReason::RateLimit);
                }
            }
            401 | 403 => {
                runtime.error_count += 1;
                if runtime.error_count >= account_failure_threshold {
                    runtime.is_available = false;
                    runtime.cooldown_reason = Some(CooldownReason::ErrorDisable);
                }
            }
            500..=599 => {
                runtime.error_count += 1;
                if runtime.error_count >= account_failure_threshold {
                    runtime.is_available = false;
                    runtime.cooldown_reason = Some(CooldownReason::ErrorDisable);
                }
            }
            200..=299 => {
                runtime.error_count = 0;
                runtime.is_available = true;
                runtime.cooldown_reason = None;
            }
            _ => {}
        }
    }

    pub fn handle_non_http_error(&self, where_: &str, request_id: &str, account_failure_threshold: u32) {
        let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
        runtime.error_count += 1;
        log::warn!(
            "event=account_non_http_error request_id={request_id} where={where_} error_count={}",
            runtime.error_count
        );
        if runtime.error_count >= account_failure_threshold {
            runtime.is_available = false;
            runtime.cooldown_reason = Some(CooldownReason::ErrorDisable);
        }
    }

    pub fn record_success(&self) {
        let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
        runtime.error_count = 0;
        runtime.is_available = true;
        runtime.cooldown_reason = None;
        runtime.conversation_count += 1;
    }

    pub fn conversation_count(&self) -> u64 {
        self.runtime.lock().expect("runtime mutex poisoned").conversation_count
    }

    pub fn bump_session_usage(&self) {
        self.runtime.lock().expect("runtime mutex poisoned").session_usage_count += 1;
    }
}

/// Account pool: round-robin over eligible accounts, guarded by
/// a single process mutex over the pool's round-robin cursor and
/// membership map. Eligibility is
/// "should_retry ∧ not expired ∧ not disabled ∧ quota available", a
/// generalization of the usual "active + usage below 100%" candidate filter.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    accounts: Vec<Arc<AccountState>>,
    by_id: HashMap<String, usize>,
    cursor: usize,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let mut by_id = HashMap::new();
        let states: Vec<Arc<AccountState>> = accounts
            .into_iter()
            .enumerate()
            .map(|(i, a)| {
                by_id.insert(a.account_id.clone(), i);
                Arc::new(AccountState::new(a))
            })
            .collect();
        AccountPool {
            inner: Mutex::new(PoolInner {
                accounts: states,
                by_id,
                cursor: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_by_id(&self, account_id: &str) -> Option<Arc<AccountState>> {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner
            .by_id
            .get(account_id)
            .and_then(|i| inner.accounts.get(*i))
            .cloned()
    }

    /// Explicit id lookup, or round-robin among eligible
    /// accounts for `quota_class`. Fairness: the cursor always advances, so
    /// between two selections of the same account every other eligible
    /// account is offered at least once.
    pub fn get(
        &self,
        account_id: Option<&str>,
        quota_class: QuotaClass,
    ) -> Result<Arc<AccountState>, GatewayError> {
        if let Some(id) = account_id {
            let state = self.get_by_id(id).ok_or(GatewayError::NoAccountAvailable)?;
            if state.should_retry() && !state.is_session_expired() && state.is_quota_available(quota_class) {
                return Ok(state);
            }
            return Err(GatewayError::NoAccountAvailable);
        }

        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let n = inner.accounts.len();
        if n == 0 {
            return Err(GatewayError::NoAccountAvailable);
        }
        for offset in 0..n {
            let idx = (inner.cursor + offset) % n;
            let candidate = inner.accounts[idx].clone();
            if candidate.should_retry()
                && !candidate.is_session_expired()
                && candidate.is_quota_available(quota_class)
            {
                inner.cursor = (idx + 1) % n;
                return Ok(candidate);
            }
        }
        Err(GatewayError::NoAccountAvailable)
    }

    /// Round-robin among eligible accounts not present in `excluded`,
    /// for the retry loop picking a new account while skipping excluded ones.
    pub fn get_excluding(
        &self,
        excluded: &std::collections::HashSet<String>,
        quota_class: QuotaClass,
    ) -> Result<Arc<AccountState>, GatewayError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let n = inner.accounts.len();
        if n == 0 {
            return Err(GatewayError::NoAccountAvailable);
        }
        for offset in 0..n {
            let idx = (inner.cursor + offset) % n;
            let candidate = inner.accounts[idx].clone();
            if excluded.contains(&candidate.account_id()) {
                continue;
            }
            if candidate.should_retry()
                && !candidate.is_session_expired()
                && candidate.is_quota_available(quota_class)
            {
                inner.cursor = (idx + 1) % n;
                return Ok(candidate);
            }
        }
        Err(GatewayError::NoAccountAvailable)
    }

    /// Atomic swap preserving runtime state for accounts
    /// whose id persists across the swap.
    pub fn reload(&self, new_accounts: Vec<Account>) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let old_by_id: HashMap<String, Arc<AccountState>> = inner
            .accounts
            .drain(..)
            .map(|state| {
                let id = state.account_id();
                (id, state)
            })
            .collect();

        let mut by_id = HashMap::new();
        let mut accounts = Vec::with_capacity(new_accounts.len());
        for account in new_accounts {
            let id = account.account_id.clone();
            let state = match old_by_id.get(&id) {
                Some(existing) => {
                    *existing.account.lock().expect("account mutex poisoned") = account;
                    existing.clone()
                }
                None => Arc::new(AccountState::new(account)),
            };
            by_id.insert(id, accounts.len());
            accounts.push(state);
        }

        inner.accounts = accounts;
        inner.by_id = by_id;
        inner.cursor = 0;
    }

    pub fn all(&self) -> Vec<Arc<AccountState>> {
        self.inner.lock().expect("pool mutex poisoned").accounts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acctrelay_core::model::MailProviderConfig;

    fn test_account(id: &str) -> Account {
        Account {
            account_id: id.to_string(),
            csesidx: "cses".to_string(),
            config_id: "cfg".to_string(),
            secure_c_ses: "s".to_string(),
            host_c_oses: None,
            expires_at: now_ts() + 3600,
            account_expires_at: None,
            mail: MailProviderConfig::Gptmail {
                base_url: "https://mail.example".into(),
                api_key: "k".into(),
            },
            disabled: false,
        }
    }

    #[test]
    fn round_robin_is_fair_across_eligible_accounts() {
        let pool = AccountPool::new(vec![test_account("a"), test_account("b"), test_account("c")]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let picked = pool.get(None, QuotaClass::Text).expect("account available");
            seen.push(picked.account_id());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn quota_cooldown_is_isolated_per_class() {
        let pool = AccountPool::new(vec![test_account("a")]);
        let state = pool.get(Some("a"), QuotaClass::Text).expect("a");
        state.handle_http_error(429, true, QuotaClass::Images, 300, 5);
        assert!(!state.is_quota_available(QuotaClass::Images));
        assert!(state.is_quota_available(QuotaClass::Text));
        assert!(pool.get(None, QuotaClass::Text).is_ok());
    }

    #[test]
    fn single_error_disables_when_threshold_is_one() {
        let pool = AccountPool::new(vec![test_account("a")]);
        let state = pool.get(Some("a"), QuotaClass::Text).expect("a");
        state.handle_http_error(401, false, QuotaClass::Text, 300, 1);
        assert!(!state.should_retry());
    }

    #[test]
    fn rate_limit_does_not_increment_error_count() {
        let pool = AccountPool::new(vec![test_account("a")]);
        let state = pool.get(Some("a"), QuotaClass::Text).expect("a");
        state.handle_http_error(429, true, QuotaClass::Text, 300, 1);
        // resource_exhausted routes through the per-quota-class cooldown,
        // leaving global availability untouched
        assert!(state.should_retry());
        assert!(!state.is_quota_available(QuotaClass::Text));
        state.handle_non_http_error("probe", "req-1", 5);
        // still below threshold of 5 after a single non-http error
        assert!(state.should_retry());
    }

    #[test]
    fn reload_preserves_runtime_state_for_surviving_accounts() {
        let pool = AccountPool::new(vec![test_account("a"), test_account("b")]);
        let state_a = pool.get(Some("a"), QuotaClass::Text).expect("a");
        state_a.handle_http_error(500, false, QuotaClass::Text, 300, 10);
        assert_eq!(state_a.account_id(), "a");

        pool.reload(vec![test_account("a"), test_account("c")]);
        assert_eq!(pool.len(), 2);
        let reloaded_a = pool.get_by_id("a").expect("a survives reload");
        // error_count carried over means one more 500 still doesn't disable (threshold 10)
        reloaded_a.handle_http_error(500, false, QuotaClass::Text, 300, 10);
        assert!(reloaded_a.should_retry());
        assert!(pool.get_by_id("b").is_none());
        assert!(pool.get_by_id("c").is_some());
    }

    #[test]
    fn get_excluding_skips_excluded_accounts() {
        let pool = AccountPool::new(vec![test_account("a"), test_account("b")]);
        let mut excluded = std::collections::HashSet::new();
        excluded.insert("a".to_string());
        let picked = pool.get_excluding(&excluded, QuotaClass::Text).expect("b available");
        assert_eq!(picked.account_id(), "b");
    }

    #[test]
    fn get_excluding_fails_when_all_excluded() {
        let pool = AccountPool::new(vec![test_account("a")]);
        let mut excluded = std::collections::HashSet::new();
        excluded.insert("a".to_string());
        assert!(pool.get_excluding(&excluded, QuotaClass::Text).is_err());
    }
}
