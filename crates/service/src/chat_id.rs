//! `chat_id` derivation: a strict priority list turning an
//! inbound request into the conversation fingerprint used to key the
//! session-binding cache. Never exposed to clients.

use sha2::{Digest, Sha256};

const FINGERPRINT_TEXT_LIMIT: usize = 500;
const CONVERSATION_HEADER_NAMES: [&str; 2] = ["x-conversation-id", "x-chat-id"];
const CONVERSATION_BODY_FIELDS: [&str; 2] = ["conversation_id", "chat_id"];

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct ChatIdInputs<'a> {
    pub api_key: Option<&'a str>,
    pub headers: &'a [(String, String)],
    pub body: &'a serde_json::Value,
    pub client_ip: &'a str,
    pub first_user_role: &'a str,
    pub first_user_text: &'a str,
}

/// Priority list: (1) hash of the API key if present; (2) configured
/// header names; (3) body fields / nested metadata; (4) fingerprint of
/// client-ip + role + first 500 chars of the first user message.
pub fn derive_chat_id(inputs: &ChatIdInputs<'_>) -> String {
    if let Some(key) = inputs.api_key {
        if !key.is_empty() {
            return format!("apikey:{}", sha256_hex(key));
        }
    }

    for header_name in CONVERSATION_HEADER_NAMES {
        if let Some((_, value)) = inputs
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(header_name))
        {
            if !value.is_empty() {
                return format!("header:{value}");
            }
        }
    }

    for field in CONVERSATION_BODY_FIELDS {
        if let Some(value) = inputs.body.get(field).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return format!("body:{value}");
            }
        }
    }
    if let Some(value) = inputs
        .body
        .get("metadata")
        .and_then(|m| m.get("conversation_id"))
        .and_then(|v| v.as_str())
    {
        if !value.is_empty() {
            return format!("body:{value}");
        }
    }

    let truncated: String = inputs
        .first_user_text
        .chars()
        .take(FINGERPRINT_TEXT_LIMIT)
        .collect();
    let fingerprint_source = format!("{}|{}|{}", inputs.client_ip, inputs.first_user_role, truncated);
    format!("fp:{}", sha256_hex(&fingerprint_source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_takes_priority_over_everything_else() {
        let body = serde_json::json!({"conversation_id": "conv-1"});
        let inputs = ChatIdInputs {
            api_key: Some("sk-test"),
            headers: &[("x-conversation-id".to_string(), "hdr-1".to_string())],
            body: &body,
            client_ip: "1.2.3.4",
            first_user_role: "user",
            first_user_text: "hi",
        };
        let id = derive_chat_id(&inputs);
        assert!(id.starts_with("apikey:"));
    }

    #[test]
    fn header_beats_body_and_fingerprint() {
        let body = serde_json::json!({"conversation_id": "conv-1"});
        let inputs = ChatIdInputs {
            api_key: None,
            headers: &[("X-Conversation-Id".to_string(), "hdr-1".to_string())],
            body: &body,
            client_ip: "1.2.3.4",
            first_user_role: "user",
            first_user_text: "hi",
        };
        assert_eq!(derive_chat_id(&inputs), "header:hdr-1");
    }

    #[test]
    fn falls_back_to_fingerprint_when_nothing_else_present() {
        let body = serde_json::json!({});
        let inputs = ChatIdInputs {
            api_key: None,
            headers: &[],
            body: &body,
            client_ip: "1.2.3.4",
            first_user_role: "user",
            first_user_text: "hello world",
        };
        let id = derive_chat_id(&inputs);
        assert!(id.starts_with("fp:"));
    }

    #[test]
    fn fingerprint_truncates_to_500_chars() {
        let long_text = "a".repeat(1000);
        let body = serde_json::json!({});
        let inputs_a = ChatIdInputs {
            api_key: None,
            headers: &[],
            body: &body,
            client_ip: "1.2.3.4",
            first_user_role: "user",
            first_user_text: &long_text,
        };
        let mut other_tail = "a".repeat(500);
        other_tail.push_str(&"b".repeat(500));
        let inputs_b = ChatIdInputs {
            api_key: None,
            headers: &[],
            body: &body,
            client_ip: "1.2.3.4",
            first_user_role: "user",
            first_user_text: &other_tail,
        };
        assert_eq!(derive_chat_id(&inputs_a), derive_chat_id(&inputs_b));
    }
}
