//! Message normalizer: OpenAI-shape message parsing, inline/URL
//! image extraction, the first-turn-vs-retry message trim, and the
//! full-context transcript builder used when a retry must catch up a new
//! session on a different account.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::http_clients::TrafficClient;

#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                    part.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn extract_inline_images_from_content(content: &Value) -> Vec<(String, Vec<u8>)> {
    let Value::Array(parts) = content else {
        return Vec::new();
    };
    parts
        .iter()
        .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("image_url"))
        .filter_map(|part| part.get("image_url").and_then(|u| u.get("url")).and_then(|v| v.as_str()))
        .filter_map(|url| decode_data_uri(url))
        .collect()
}

fn decode_data_uri(url: &str) -> Option<(String, Vec<u8>)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?.to_string();
    let bytes = BASE64_STANDARD.decode(data).ok()?;
    Some((mime, bytes))
}

fn collect_image_urls(content: &Value) -> Vec<String> {
    let Value::Array(parts) = content else {
        return Vec::new();
    };
    parts
        .iter()
        .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("image_url"))
        .filter_map(|part| part.get("image_url").and_then(|u| u.get("url")).and_then(|v| v.as_str()))
        .filter(|url| !url.starts_with("data:"))
        .map(|s| s.to_string())
        .collect()
}

/// `parse_last_message`: returns `(last_user_text, inline_images)`.
/// Remote image URLs are fetched honoring the chat traffic-class proxy
/// policy; fetch failures are skipped rather than failing the whole
/// request -- a dropped image is not account-affecting.
pub async fn parse_last_message(
    messages: &[Value],
    chat_client: &TrafficClient,
) -> (String, Vec<InlineImage>) {
    let last_user = messages.iter().rev().find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"));
    let Some(message) = last_user else {
        return (String::new(), Vec::new());
    };
    let content = message.get("content").cloned().unwrap_or(Value::Null);
    let text = content_text(&content);

    let mut images: Vec<InlineImage> = extract_inline_images_from_content(&content)
        .into_iter()
        .map(|(mime, bytes)| InlineImage { mime, bytes })
        .collect();

    for url in collect_image_urls(&content) {
        if let Ok(resp) = chat_client.request(reqwest::Method::GET, &url).send().await {
            let mime = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            if let Ok(bytes) = resp.bytes().await {
                images.push(InlineImage {
                    mime,
                    bytes: bytes.to_vec(),
                });
            }
        }
    }

    (text, images)
}

/// `strip_to_last_user_message`. Idempotent for `is_first=false`:
/// applying it twice equals applying it once, since the second pass
/// sees only the already-trailing user message.
pub fn strip_to_last_user_message(messages: &[Value], is_first: bool) -> Vec<Value> {
    let trailing_user = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        .cloned();

    if !is_first {
        return trailing_user.into_iter().collect();
    }

    let mut out: Vec<Value> = messages
        .iter()
        .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"))
        .cloned()
        .collect();
    if let Some(user) = trailing_user {
        out.push(user);
    }
    out
}

/// `build_full_context_text`: a human-readable `role: content`
/// transcript for the retry path that must catch up a brand-new session.
pub fn build_full_context_text(messages: &[Value]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = m.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let content = m.get("content").cloned().unwrap_or(Value::Null);
            format!("{role}: {}", content_text(&content))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_first_keeps_system_messages_and_trailing_user() {
        let messages = vec![
            serde_json::json!({"role": "system", "content": "sys1"}),
            serde_json::json!({"role": "user", "content": "old"}),
            serde_json::json!({"role": "assistant", "content": "old reply"}),
            serde_json::json!({"role": "user", "content": "new"}),
        ];
        let out = strip_to_last_user_message(&messages, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[1]["content"], "new");
    }

    #[test]
    fn strip_non_first_keeps_only_trailing_user() {
        let messages = vec![
            serde_json::json!({"role": "system", "content": "sys1"}),
            serde_json::json!({"role": "user", "content": "new"}),
        ];
        let out = strip_to_last_user_message(&messages, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["content"], "new");
    }

    #[test]
    fn strip_non_first_is_idempotent() {
        let messages = vec![
            serde_json::json!({"role": "system", "content": "sys1"}),
            serde_json::json!({"role": "user", "content": "new"}),
        ];
        let once = strip_to_last_user_message(&messages, false);
        let twice = strip_to_last_user_message(&once, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn build_full_context_text_joins_role_and_content() {
        let messages = vec![
            serde_json::json!({"role": "system", "content": "be nice"}),
            serde_json::json!({"role": "user", "content": "hi"}),
        ];
        let text = build_full_context_text(&messages);
        assert_eq!(text, "system: be nice\nuser: hi");
    }

    #[test]
    fn decode_data_uri_parses_mime_and_bytes() {
        let encoded = BASE64_STANDARD.encode(b"hello");
        let uri = format!("data:image/png;base64,{encoded}");
        let (mime, bytes) = decode_data_uri(&uri).expect("decode");
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }
}
