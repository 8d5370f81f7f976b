//! Persistent and wire-level data shapes shared between the storage layer
//! and the service crate's runtime state. Anything
//! that is "never persisted" (account availability, cooldown deadlines,
//! JWT cache) lives in `acctrelay-service` instead, next to the code that
//! mutates it.

use serde::{Deserialize, Serialize};

/// One of the three upstream usage buckets a model id maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaClass {
    Text,
    Images,
    Videos,
}

impl QuotaClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaClass::Text => "text",
            QuotaClass::Images => "images",
            QuotaClass::Videos => "videos",
        }
    }

    /// Virtual models `gemini-imagen`/`gemini-veo` route to their own
    /// quota class; everything else is `text`.
    pub fn from_model_id(model_id: &str) -> Self {
        match model_id {
            "gemini-imagen" => QuotaClass::Images,
            "gemini-veo" => QuotaClass::Videos,
            _ => QuotaClass::Text,
        }
    }

    pub const ALL: [QuotaClass; 3] = [QuotaClass::Text, QuotaClass::Images, QuotaClass::Videos];
}

/// Provider-tagged mail descriptor: an interface with five variants,
/// selected by string tag rather than attribute sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum MailProviderConfig {
    Microsoft {
        refresh_token: String,
        tenant: String,
        client_id: String,
    },
    Duckmail {
        base_url: String,
        api_key: String,
    },
    Moemail {
        base_url: String,
        api_key: String,
    },
    Freemail {
        base_url: String,
        password: String,
        email_id: String,
    },
    Gptmail {
        base_url: String,
        api_key: String,
    },
}

impl MailProviderConfig {
    pub fn tag(&self) -> &'static str {
        match self {
            MailProviderConfig::Microsoft { .. } => "microsoft",
            MailProviderConfig::Duckmail { .. } => "duckmail",
            MailProviderConfig::Moemail { .. } => "moemail",
            MailProviderConfig::Freemail { .. } => "freemail",
            MailProviderConfig::Gptmail { .. } => "gptmail",
        }
    }
}

/// Account document as persisted under the `accounts` KV key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub csesidx: String,
    pub config_id: String,
    pub secure_c_ses: String,
    pub host_c_oses: Option<String>,
    /// Session expiry, epoch seconds.
    pub expires_at: i64,
    /// Account lifetime, independent of session expiry.
    pub account_expires_at: Option<i64>,
    pub mail: MailProviderConfig,
    #[serde(default)]
    pub disabled: bool,
}

impl Account {
    /// `config_id` and `csesidx` must be non-empty for a usable account.
    pub fn has_usable_credentials(&self) -> bool {
        !self.config_id.is_empty() && !self.csesidx.is_empty()
    }
}

/// `chat_id -> (account_id, session_id, created_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBinding {
    pub account_id: String,
    pub session_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Register,
    Refresh,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Register => "register",
            TaskKind::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

pub const TASK_RESULTS_CAP: usize = 200;
pub const TASK_LOGS_CAP: usize = 120;
pub const TASK_RETAIN_COMPLETED: usize = 10;

/// `task_id -> {...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: f32,
    pub success_count: u32,
    pub fail_count: u32,
    pub results: Vec<serde_json::Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl TaskRecord {
    pub fn new(task_id: String, kind: TaskKind, now: i64) -> Self {
        TaskRecord {
            task_id,
            kind,
            status: TaskStatus::Pending,
            progress: 0.0,
            success_count: 0,
            fail_count: 0,
            results: Vec::new(),
            logs: Vec::new(),
            error: None,
            cancel_requested: false,
            cancel_reason: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Ring-buffer append capped at `TASK_LOGS_CAP` entries.
    pub fn push_log(&mut self, line: String) {
        self.logs.push(line);
        if self.logs.len() > TASK_LOGS_CAP {
            let overflow = self.logs.len() - TASK_LOGS_CAP;
            self.logs.drain(0..overflow);
        }
    }

    /// Keep only the well-known keys a result document needs, capping the
    /// overall result set at `TASK_RESULTS_CAP` entries.
    pub fn push_result(&mut self, result: serde_json::Value) {
        const KEEP_KEYS: [&str; 6] = [
            "account_id",
            "success",
            "error",
            "email",
            "expires_at",
            "config_id",
        ];
        let compacted = match result {
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for key in KEEP_KEYS {
                    if let Some(v) = map.get(key) {
                        out.insert(key.to_string(), v.clone());
                    }
                }
                serde_json::Value::Object(out)
            }
            other => other,
        };
        self.results.push(compacted);
        if self.results.len() > TASK_RESULTS_CAP {
            let overflow = self.results.len() - TASK_RESULTS_CAP;
            self.results.drain(0..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_class_from_model_id_routes_virtual_models() {
        assert_eq!(QuotaClass::from_model_id("gemini-imagen"), QuotaClass::Images);
        assert_eq!(QuotaClass::from_model_id("gemini-veo"), QuotaClass::Videos);
        assert_eq!(QuotaClass::from_model_id("gemini-2.5-flash"), QuotaClass::Text);
    }

    #[test]
    fn account_requires_config_id_and_csesidx() {
        let mut account = Account {
            account_id: "a@x.com".into(),
            csesidx: "c".into(),
            config_id: "cfg".into(),
            secure_c_ses: "s".into(),
            host_c_oses: None,
            expires_at: 0,
            account_expires_at: None,
            mail: MailProviderConfig::Gptmail {
                base_url: "https://mail.example".into(),
                api_key: "k".into(),
            },
            disabled: false,
        };
        assert!(account.has_usable_credentials());
        account.csesidx.clear();
        assert!(!account.has_usable_credentials());
    }

    #[test]
    fn task_record_caps_logs_and_results() {
        let mut task = TaskRecord::new("t1".into(), TaskKind::Register, 0);
        for i in 0..(TASK_LOGS_CAP + 10) {
            task.push_log(format!("line-{i}"));
        }
        assert_eq!(task.logs.len(), TASK_LOGS_CAP);
        assert_eq!(task.logs.first().unwrap(), &format!("line-{}", 10));

        for _ in 0..(TASK_RESULTS_CAP + 5) {
            task.push_result(serde_json::json!({"account_id": "a", "success": true, "extra": "drop-me"}));
        }
        assert_eq!(task.results.len(), TASK_RESULTS_CAP);
        assert!(task.results[0].get("extra").is_none());
    }
}
