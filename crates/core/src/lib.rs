pub mod jwt;
pub mod kq;
pub mod mail;
pub mod model;
pub mod storage;
pub mod time;

pub use mail::{MailError, MailProvider};
pub use model::{
    Account, MailProviderConfig, QuotaClass, SessionBinding, TaskKind, TaskRecord, TaskStatus,
};
pub use storage::{Storage, StorageError};

pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
