//! API key verification: a single legacy key,
//! or a key-list tagged with a binding mode, or—when nothing is
//! configured—a synthetic open-access default.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Stable binding from this key to a specific upstream account.
    Memory,
    /// Each request treated independently; no binding is kept.
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub mode: KeyMode,
    pub remark: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct VerifiedKey {
    pub token: String,
    pub mode: KeyMode,
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses `Authorization: Bearer <token>` and resolves it against either
/// the legacy key or the key-list. An empty configuration opens the
/// endpoint with a synthetic `memory`-mode key.
pub fn verify_bearer(
    auth_header: Option<&str>,
    keys: &[ApiKeyRecord],
    legacy_key: &str,
) -> Result<VerifiedKey, GatewayError> {
    let token = auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::AuthMissing)?;

    if keys.is_empty() && legacy_key.is_empty() {
        return Ok(VerifiedKey {
            token: token.to_string(),
            mode: KeyMode::Memory,
        });
    }

    if !legacy_key.is_empty() && token == legacy_key {
        return Ok(VerifiedKey {
            token: token.to_string(),
            mode: KeyMode::Memory,
        });
    }

    keys.iter()
        .find(|k| k.key == token)
        .map(|k| VerifiedKey {
            token: token.to_string(),
            mode: k.mode,
        })
        .ok_or(GatewayError::AuthInvalid)
}

/// `mode=memory` binding key fed into `chat_id` derivation's api-key branch.
pub fn memory_binding_key(token: &str) -> String {
    sha256_hex(&format!("apikey:{token}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_access_when_unconfigured() {
        let verified = verify_bearer(Some("Bearer anything"), &[], "").expect("open");
        assert_eq!(verified.mode, KeyMode::Memory);
    }

    #[test]
    fn legacy_key_matches_exactly() {
        let verified = verify_bearer(Some("Bearer sk-legacy"), &[], "sk-legacy").expect("match");
        assert_eq!(verified.token, "sk-legacy");
        assert!(verify_bearer(Some("Bearer wrong"), &[], "sk-legacy").is_err());
    }

    #[test]
    fn key_list_resolves_mode() {
        let keys = vec![ApiKeyRecord {
            key: "sk-fast".to_string(),
            mode: KeyMode::Fast,
            remark: "ci".to_string(),
            created_at: 0,
        }];
        let verified = verify_bearer(Some("Bearer sk-fast"), &keys, "").expect("found");
        assert_eq!(verified.mode, KeyMode::Fast);
        assert!(verify_bearer(Some("Bearer sk-unknown"), &keys, "").is_err());
    }

    #[test]
    fn missing_header_is_auth_missing() {
        assert!(matches!(verify_bearer(None, &[], ""), Err(GatewayError::AuthMissing)));
    }
}
