//! Tagged outcomes instead of broad exception hierarchies. `GatewayError`
//! is the error kind taxonomy; `Outcome` is what the orchestrator's retry
//! loop actually consumes.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    AuthMissing,
    AuthInvalid,
    ModelUnknown(String),
    NoAccountAvailable,
    AccountRateLimited { resource_exhausted: bool },
    AccountAuthExpired,
    UpstreamServerError(u16),
    Network(String),
    JwtRefreshFailed(String),
    StreamParseError(String),
    EmptyResponse,
    MediaDownloadFailed(String),
    Timeout,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AuthMissing => write!(f, "missing Authorization header"),
            GatewayError::AuthInvalid => write!(f, "invalid API key"),
            GatewayError::ModelUnknown(m) => write!(f, "unknown model: {m}"),
            GatewayError::NoAccountAvailable => write!(f, "no account available"),
            GatewayError::AccountRateLimited { .. } => write!(f, "account rate limited"),
            GatewayError::AccountAuthExpired => write!(f, "account auth expired"),
            GatewayError::UpstreamServerError(s) => write!(f, "upstream server error: {s}"),
            GatewayError::Network(e) => write!(f, "network error: {e}"),
            GatewayError::JwtRefreshFailed(e) => write!(f, "jwt refresh failed: {e}"),
            GatewayError::StreamParseError(e) => write!(f, "stream parse error: {e}"),
            GatewayError::EmptyResponse => write!(f, "empty response"),
            GatewayError::MediaDownloadFailed(e) => write!(f, "media download failed: {e}"),
            GatewayError::Timeout => write!(f, "upstream timeout"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// HTTP status this error maps to at the `/v1/*` boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => 401,
            GatewayError::ModelUnknown(_) => 404,
            GatewayError::NoAccountAvailable => 503,
            GatewayError::AccountRateLimited { .. } => 429,
            GatewayError::Timeout => 504,
            _ => 502,
        }
    }

    /// Whether the orchestrator should try another account/attempt.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            GatewayError::AuthMissing | GatewayError::AuthInvalid | GatewayError::ModelUnknown(_)
        )
    }
}

impl From<acctrelay_core::StorageError> for GatewayError {
    fn from(e: acctrelay_core::StorageError) -> Self {
        GatewayError::Network(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

/// The typed outcome the retry loop consumes: tagged results rather than
/// catching broad exception hierarchies.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Retryable(GatewayError),
    Fatal(GatewayError),
}

#[derive(Debug, Clone)]
pub enum TaskError {
    SubprocessSpawn(String),
    SubprocessTimeout,
    Cancelled(Option<String>),
    Protocol(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::SubprocessSpawn(e) => write!(f, "subprocess spawn failed: {e}"),
            TaskError::SubprocessTimeout => write!(f, "subprocess timed out"),
            TaskError::Cancelled(reason) => write!(
                f,
                "task cancelled{}",
                reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default()
            ),
            TaskError::Protocol(e) => write!(f, "subprocess protocol error: {e}"),
        }
    }
}

impl std::error::Error for TaskError {}
