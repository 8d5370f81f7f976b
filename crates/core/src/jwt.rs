//! Pure JWT assembly for the upstream bearer token. The networked
//! refresh flow (cookies, HTTP GET, caching, background refresh) lives in
//! `acctrelay-service::jwt_minter`; this module only builds/signs the token
//! once the caller already has the rotating key material.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::kq::{kq_encode, urlsafe_b64decode_with_pad, urlsafe_b64encode_nopad};

const ISSUER: &str = "https://business.gemini.google";
const AUDIENCE: &str = "https://biz-discoveryengine.googleapis.com";
/// JWT validity window accepted by upstream.
pub const JWT_TTL_SECS: i64 = 300;
/// Cache expiry buffer: refresh 30s before the upstream-declared expiry.
pub const JWT_CACHE_BUFFER_SECS: i64 = 30;

#[derive(Serialize)]
struct Header<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Serialize)]
struct Payload {
    iss: &'static str,
    aud: &'static str,
    sub: String,
    iat: i64,
    exp: i64,
    nbf: i64,
}

/// The upstream `getoxsrf` response body, after stripping the optional XSSI
/// prefix `)]}'`.
#[derive(Debug, Clone, Deserialize)]
pub struct OxsrfResponse {
    #[serde(rename = "xsrfToken")]
    pub xsrf_token: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

/// XSSI prefix some upstream JSON responses are prefixed with to block naive
/// `<script src>` inclusion; strip when present before parsing as JSON.
const XSSI_PREFIX: &str = ")]}'";

pub fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(XSSI_PREFIX).unwrap_or(body)
}

pub fn parse_oxsrf_response(body: &str) -> Result<OxsrfResponse, serde_json::Error> {
    serde_json::from_str(strip_xssi_prefix(body))
}

/// Decode the upstream `xsrfToken` into raw HMAC key bytes: URL-safe
/// base64, padded with `==`.
pub fn decode_key_bytes(xsrf_token: &str) -> Result<Vec<u8>, base64::DecodeError> {
    urlsafe_b64decode_with_pad(xsrf_token)
}

/// Build and sign the bearer JWT from already-fetched key material.
pub fn create_jwt(key_bytes: &[u8], key_id: &str, csesidx: &str, now: i64) -> String {
    let header = Header {
        alg: "HS256",
        typ: "JWT",
        kid: key_id,
    };
    let payload = Payload {
        iss: ISSUER,
        aud: AUDIENCE,
        sub: format!("csesidx/{csesidx}"),
        iat: now,
        exp: now + JWT_TTL_SECS,
        nbf: now,
    };
    let header_json = serde_json::to_string(&header).expect("header serializes");
    let payload_json = serde_json::to_string(&payload).expect("payload serializes");
    let header_b64 = kq_encode(&header_json);
    let payload_b64 = kq_encode(&payload_json);
    let message = format!("{header_b64}.{payload_b64}");

    let mut mac = Hmac::<Sha256>::new_from_slice(key_bytes).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    let sig = mac.finalize().into_bytes();
    let sig_b64 = urlsafe_b64encode_nopad(&sig);
    format!("{message}.{sig_b64}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_xssi_prefix_removes_only_when_present() {
        assert_eq!(strip_xssi_prefix(")]}'{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_xssi_prefix("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn parse_oxsrf_response_handles_prefixed_and_plain_bodies() {
        let plain = r#"{"xsrfToken":"abc","keyId":"k1"}"#;
        let prefixed = format!(")]}'{plain}");
        let a = parse_oxsrf_response(plain).expect("parse plain");
        let b = parse_oxsrf_response(&prefixed).expect("parse prefixed");
        assert_eq!(a.xsrf_token, "abc");
        assert_eq!(b.key_id, "k1");
    }

    #[test]
    fn create_jwt_has_three_dot_separated_parts() {
        let token = create_jwt(b"secret-key-bytes", "kid-1", "cses-42", 1_700_000_000);
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn create_jwt_is_deterministic_for_same_inputs() {
        let a = create_jwt(b"key", "kid", "cses", 100);
        let b = create_jwt(b"key", "kid", "cses", 100);
        assert_eq!(a, b);
    }

    #[test]
    fn create_jwt_signature_changes_with_key() {
        let a = create_jwt(b"key-a", "kid", "cses", 100);
        let b = create_jwt(b"key-b", "kid", "cses", 100);
        assert_ne!(a, b);
        // header.payload should be identical since only the key changed
        let a_msg = a.rsplit_once('.').unwrap().0;
        let b_msg = b.rsplit_once('.').unwrap().0;
        assert_eq!(a_msg, b_msg);
    }
}
