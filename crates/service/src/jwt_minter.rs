//! JWT minter. Builds on `acctrelay_core::jwt` for the pure
//! assembly step; this module owns the networked refresh flow: fetching
//! rotating key material, caching per account, and the background
//! pre-expiry refresh. Uses a per-account `OnceLock<Mutex<..>>` cache
//! guarded by that account's own mutex, rather than one process-wide cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acctrelay_core::jwt::{create_jwt, decode_key_bytes, parse_oxsrf_response, JWT_CACHE_BUFFER_SECS};
use acctrelay_core::time::now_ts;

use crate::account::AccountState;
use crate::error::GatewayError;
use crate::http_clients::TrafficClient;

const JWT_FETCH_TIMEOUT_SECS: u64 = 20;
/// Refresh in the background once the cached token is within this
/// many seconds of its (buffered) expiry.
const BACKGROUND_REFRESH_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Default)]
pub struct JwtCacheEntry {
    pub token: Option<String>,
    pub expiry: i64,
}

/// Per-account JWT cache + single-flight refresh guard. Embedded in
/// `AccountState` rather than keyed in a process-wide map, so the mutex
/// scope matches the account's own mutex guarding JWT refresh.
///
/// `refresh_lock` serializes the cold/expired synchronous refresh path:
/// losing callers block on the lock and then re-read `entry`, rather than
/// each firing their own `/auth/getoxsrf` call. `refreshing` remains a
/// separate flag guarding only the detached background refresh, which must
/// stay fire-and-forget instead of blocking anyone.
pub struct JwtCache {
    entry: Mutex<JwtCacheEntry>,
    refreshing: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Default for JwtCache {
    fn default() -> Self {
        JwtCache {
            entry: Mutex::new(JwtCacheEntry::default()),
            refreshing: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }
}

pub struct JwtMinter {
    upstream_base: String,
}

impl JwtMinter {
    pub fn new(upstream_base: String) -> Self {
        JwtMinter { upstream_base }
    }

    /// Blocking synchronous refresh when there's no valid
    /// cache; non-blocking background refresh (return-the-stale-token) when
    /// the cache is valid but close to expiry.
    pub async fn get(
        self: &Arc<Self>,
        client: Arc<TrafficClient>,
        account: &Arc<AccountState>,
        request_id: &str,
    ) -> Result<String, GatewayError> {
        let now = now_ts();
        let snapshot = account
            .jwt
            .entry
            .lock()
            .expect("jwt cache mutex poisoned")
            .clone();

        if let Some(token) = snapshot.token.clone() {
            if now < snapshot.expiry {
                if snapshot.expiry - now <= BACKGROUND_REFRESH_WINDOW_SECS {
                    self.clone()
                        .spawn_detached_refresh(client, account.clone(), request_id.to_string());
                }
                return Ok(token);
            }
        }

        // Cold or expired: serialize on the per-account refresh lock so
        // concurrent callers don't each fire their own upstream exchange.
        // The loser re-checks the cache once inside the lock and reuses
        // whatever the winner just minted.
        let _guard = account.jwt.refresh_lock.lock().await;
        let snapshot = account
            .jwt
            .entry
            .lock()
            .expect("jwt cache mutex poisoned")
            .clone();
        if let Some(token) = snapshot.token {
            if now_ts() < snapshot.expiry {
                return Ok(token);
            }
        }
        self.refresh_blocking(&client, account, request_id).await
    }

    /// Detached background refresh; single-flight per account via
    /// `JwtCache::refreshing`.
    pub fn spawn_detached_refresh(
        self: Arc<Self>,
        client: Arc<TrafficClient>,
        account: Arc<AccountState>,
        request_id: String,
    ) {
        if account.jwt.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            if let Err(err) = self.refresh_blocking(&client, &account, &request_id).await {
                log::warn!(
                    "event=jwt_background_refresh_failed request_id={request_id} err={err}"
                );
            }
            account.jwt.refreshing.store(false, Ordering::SeqCst);
        });
    }

    async fn refresh_blocking(
        &self,
        client: &TrafficClient,
        account: &Arc<AccountState>,
        request_id: &str,
    ) -> Result<String, GatewayError> {
        let (csesidx, secure_c_ses, host_c_oses) = {
            let doc = account.account.lock().expect("account mutex poisoned");
            (doc.csesidx.clone(), doc.secure_c_ses.clone(), doc.host_c_oses.clone())
        };

        let url = format!("{}/auth/getoxsrf", self.upstream_base);
        let mut cookie = format!("__Secure-C_SES={secure_c_ses}");
        if let Some(host_cookie) = host_c_oses.as_deref() {
            cookie.push_str(&format!("; __Host-C_OSES={host_cookie}"));
        }
        let response = client
            .request(reqwest::Method::GET, &url)
            .query(&[("csesidx", csesidx.as_str())])
            .header(reqwest::header::COOKIE, cookie)
            .timeout(Duration::from_secs(JWT_FETCH_TIMEOUT_SECS))
            .send()
            .await
            .map_err(GatewayError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(GatewayError::from)?;
        if !status.is_success() {
            log::warn!(
                "event=jwt_fetch_failed request_id={request_id} status={}",
                status.as_u16()
            );
            return Err(GatewayError::JwtRefreshFailed(format!(
                "upstream status {}",
                status.as_u16()
            )));
        }

        let parsed = parse_oxsrf_response(&body)
            .map_err(|e| GatewayError::JwtRefreshFailed(e.to_string()))?;
        let key_bytes = decode_key_bytes(&parsed.xsrf_token)
            .map_err(|e| GatewayError::JwtRefreshFailed(e.to_string()))?;

        let now = now_ts();
        let token = create_jwt(&key_bytes, &parsed.key_id, &csesidx, now);
        let mut entry = account.jwt.entry.lock().expect("jwt cache mutex poisoned");
        entry.token = Some(token.clone());
        entry.expiry = now + JWT_CACHE_BUFFER_SECS;
        log::info!("event=jwt_refreshed request_id={request_id} csesidx={csesidx}");
        Ok(token)
    }
}
