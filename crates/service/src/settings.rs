//! The `settings` KV document: basic/retry/image/video/session/
//! public_display sections, loaded from env var overrides merged with the
//! stored document, using the same env-with-fallback parsing pattern as
//! `poll_loop::parse_interval_secs`.

use serde::{Deserialize, Serialize};

use acctrelay_core::Storage;

use crate::api_keys::ApiKeyRecord;

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicSettings {
    pub admin_key: String,
    pub listen_addr: String,
    pub upstream_base: String,
    pub local_ignore_proxy: bool,
    pub proxy_url: String,
    pub no_proxy: Vec<String>,
    pub direct_fallback: bool,
    /// Accepts a single legacy key, exact match. Empty disables it.
    pub legacy_api_key: String,
}

impl Default for BasicSettings {
    fn default() -> Self {
        BasicSettings {
            admin_key: env_string("ADMIN_KEY", ""),
            listen_addr: env_string("PORT", "8080")
                .parse::<u16>()
                .map(|p| format!("0.0.0.0:{p}"))
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            upstream_base: env_string(
                "ACCTRELAY_UPSTREAM_BASE",
                "https://business.gemini.google",
            ),
            local_ignore_proxy: env_bool("LOCAL_IGNORE_PROXY", false),
            proxy_url: env_string("ACCTRELAY_PROXY_URL", ""),
            no_proxy: env_string("ACCTRELAY_NO_PROXY", "localhost,127.0.0.1")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            direct_fallback: env_bool("ACCTRELAY_DIRECT_FALLBACK", true),
            legacy_api_key: env_string("ACCTRELAY_API_KEY", ""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_request_retries: u32,
    pub account_failure_threshold: u32,
    pub rate_limit_cooldown_seconds: i64,
    pub upstream_call_timeout_secs: u64,
    pub subprocess_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_request_retries: env_u32("ACCTRELAY_MAX_REQUEST_RETRIES", 3),
            account_failure_threshold: env_u32("ACCTRELAY_ACCOUNT_FAILURE_THRESHOLD", 5),
            rate_limit_cooldown_seconds: env_u64("ACCTRELAY_RATE_LIMIT_COOLDOWN_SECS", 300) as i64,
            upstream_call_timeout_secs: env_u64("ACCTRELAY_UPSTREAM_TIMEOUT_SECS", 600),
            subprocess_timeout_secs: env_u64("ACCTRELAY_SUBPROCESS_TIMEOUT_SECS", 300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationSettings {
    pub enabled: bool,
    pub output_mode: MediaOutputMode,
}

impl Default for ImageGenerationSettings {
    fn default() -> Self {
        ImageGenerationSettings {
            enabled: true,
            output_mode: MediaOutputMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoGenerationSettings {
    pub enabled: bool,
    pub output_mode: MediaOutputMode,
}

impl Default for VideoGenerationSettings {
    fn default() -> Self {
        VideoGenerationSettings {
            enabled: true,
            output_mode: MediaOutputMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaOutputMode {
    #[default]
    InlineBase64,
    SelfHosted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub binding_ttl_secs: i64,
    pub binding_flush_interval_secs: u64,
    pub binding_max_entries: usize,
    pub auto_refresh_tick_secs: u64,
    pub auto_refresh_window_secs: i64,
    pub account_recycle_window_secs: i64,
    pub min_pool_size: usize,
    pub media_sweep_interval_secs: u64,
    pub media_max_age_secs: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            binding_ttl_secs: env_u64("ACCTRELAY_BINDING_TTL_SECS", 7 * 24 * 3600) as i64,
            binding_flush_interval_secs: env_u64("ACCTRELAY_BINDING_FLUSH_SECS", 60),
            binding_max_entries: env_u64("ACCTRELAY_BINDING_MAX_ENTRIES", 10_000) as usize,
            auto_refresh_tick_secs: env_u64("ACCTRELAY_AUTO_REFRESH_TICK_SECS", 30 * 60),
            auto_refresh_window_secs: env_u64("ACCTRELAY_AUTO_REFRESH_WINDOW_SECS", 3600) as i64,
            account_recycle_window_secs: env_u64("ACCTRELAY_RECYCLE_WINDOW_SECS", 24 * 3600) as i64,
            min_pool_size: env_u64("ACCTRELAY_MIN_POOL_SIZE", 21) as usize,
            media_sweep_interval_secs: env_u64("ACCTRELAY_MEDIA_SWEEP_SECS", 30 * 60),
            media_max_age_secs: env_u64("ACCTRELAY_MEDIA_MAX_AGE_SECS", 3600) as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicDisplaySettings {
    pub show_stats: bool,
    pub show_log: bool,
    pub base_url_override: Option<String>,
}

impl Default for PublicDisplaySettings {
    fn default() -> Self {
        PublicDisplaySettings {
            show_stats: env_bool("ACCTRELAY_PUBLIC_SHOW_STATS", true),
            show_log: env_bool("ACCTRELAY_PUBLIC_SHOW_LOG", true),
            base_url_override: std::env::var("ACCTRELAY_PUBLIC_BASE_URL").ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub basic: BasicSettingsOpt,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub image_generation: ImageGenerationSettings,
    #[serde(default)]
    pub video_generation: VideoGenerationSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub public_display: PublicDisplaySettings,
    /// Any key in a key-list with attributes {key, mode, remark,
    /// created_at}. Admin-editable via `/admin/*`.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyRecord>,
}

/// `basic` is kept separately loadable because `admin_key`/`listen_addr`
/// must never be silently overridden by a stale stored document once the
/// process has booted from env vars.
pub type BasicSettingsOpt = BasicSettings;

impl Settings {
    /// Env-var defaults layered first, then the stored document overlays
    /// the non-secret sections.
    pub fn load(storage: &Storage) -> Self {
        let mut settings = Settings::default();
        if let Ok(Some(stored)) = storage.get_json::<Settings>(acctrelay_core::storage::KEY_SETTINGS)
        {
            settings.retry = stored.retry;
            settings.image_generation = stored.image_generation;
            settings.video_generation = stored.video_generation;
            settings.session = stored.session;
            settings.public_display = stored.public_display;
            settings.api_keys = stored.api_keys;
        }
        settings
    }

    pub fn persist(&self, storage: &Storage) -> Result<(), acctrelay_core::StorageError> {
        storage.set_json(acctrelay_core::storage::KEY_SETTINGS, self)
    }
}
