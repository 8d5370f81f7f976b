//! Key-value document persistence. Backed by a bundled
//! rusqlite table (`kv_documents(key, value, updated_at)`, using an
//! upsert-via-`ON CONFLICT` write) with a flat-file fallback under a
//! platform data directory when no database is configured.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::time::now_ts;

#[derive(Debug)]
pub enum StorageError {
    Sqlite(String),
    Io(String),
    Serde(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "storage: sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "storage: io error: {e}"),
            StorageError::Serde(e) => write!(f, "storage: serde error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e.to_string())
    }
}

/// Well-known document keys.
pub const KEY_ACCOUNTS: &str = "accounts";
pub const KEY_SETTINGS: &str = "settings";
pub const KEY_SESSION_BINDINGS: &str = "session_bindings";
pub const KEY_STATS: &str = "stats";

enum Backend {
    Sqlite(Mutex<rusqlite::Connection>),
    FlatFile(PathBuf),
}

/// Asynchronous-from-the-caller's-view KV store; the blocking sqlite/file
/// calls are short enough that callers in the service crate offload them to
/// `spawn_blocking` rather than this crate depending on an async runtime.
pub struct Storage {
    backend: Backend,
}

impl Storage {
    pub fn open_sqlite(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = rusqlite::Connection::open(path)?;
        let storage = Storage {
            backend: Backend::Sqlite(Mutex::new(conn)),
        };
        storage.init()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let storage = Storage {
            backend: Backend::Sqlite(Mutex::new(conn)),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Flat-file fallback under a platform data directory, used when no
    /// database backend is configured.
    pub fn open_flat_file(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        Ok(Storage {
            backend: Backend::FlatFile(dir),
        })
    }

    /// Resolve `DATABASE_URL` if set, else a platform data directory via
    /// `dirs::data_dir()`.
    pub fn open_default(database_url: Option<&str>, app_name: &str) -> Result<Self, StorageError> {
        if let Some(url) = database_url {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            return Self::open_sqlite(Path::new(path));
        }
        let dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(app_name);
        Self::open_flat_file(dir)
    }

    pub fn init(&self) -> Result<(), StorageError> {
        if let Backend::Sqlite(conn) = &self.backend {
            let conn = conn.lock().expect("storage mutex poisoned");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv_documents (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
            )?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().expect("storage mutex poisoned");
                let mut stmt =
                    conn.prepare("SELECT value FROM kv_documents WHERE key = ?1")?;
                let mut rows = stmt.query(rusqlite::params![key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            }
            Backend::FlatFile(dir) => {
                let path = flat_file_path(dir, key);
                if !path.is_file() {
                    return Ok(None);
                }
                Ok(Some(fs::read_to_string(path)?))
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().expect("storage mutex poisoned");
                conn.execute(
                    "INSERT INTO kv_documents (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    rusqlite::params![key, value, now_ts()],
                )?;
                Ok(())
            }
            Backend::FlatFile(dir) => {
                let path = flat_file_path(dir, key);
                fs::write(path, value)?;
                Ok(())
            }
        }
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

fn flat_file_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, MailProviderConfig};

    #[test]
    fn sqlite_backend_roundtrips_raw_value() {
        let storage = Storage::open_in_memory().expect("open");
        assert_eq!(storage.get("missing").expect("get"), None);
        storage.set("settings", "{\"a\":1}").expect("set");
        assert_eq!(
            storage.get("settings").expect("get").as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn sqlite_backend_upsert_overwrites() {
        let storage = Storage::open_in_memory().expect("open");
        storage.set(KEY_STATS, "1").expect("set 1");
        storage.set(KEY_STATS, "2").expect("set 2");
        assert_eq!(storage.get(KEY_STATS).expect("get").as_deref(), Some("2"));
    }

    #[test]
    fn typed_json_roundtrip_for_accounts() {
        let storage = Storage::open_in_memory().expect("open");
        let accounts = vec![Account {
            account_id: "a@x.com".into(),
            csesidx: "c".into(),
            config_id: "cfg".into(),
            secure_c_ses: "s".into(),
            host_c_oses: Some("h".into()),
            expires_at: 123,
            account_expires_at: None,
            mail: MailProviderConfig::Duckmail {
                base_url: "https://mail.example".into(),
                api_key: "k".into(),
            },
            disabled: false,
        }];
        storage
            .set_json(KEY_ACCOUNTS, &accounts)
            .expect("set accounts");
        let loaded: Vec<Account> = storage
            .get_json(KEY_ACCOUNTS)
            .expect("get accounts")
            .expect("present");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].account_id, "a@x.com");
    }

    #[test]
    fn flat_file_backend_roundtrips() {
        let dir = std::env::temp_dir().join(format!(
            "acctrelay-storage-test-{}-{}",
            std::process::id(),
            now_ts()
        ));
        let storage = Storage::open_flat_file(dir.clone()).expect("open flat file");
        storage.set(KEY_SETTINGS, "{\"x\":true}").expect("set");
        assert_eq!(
            storage.get(KEY_SETTINGS).expect("get").as_deref(),
            Some("{\"x\":true}")
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
