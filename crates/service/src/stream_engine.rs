//! Streaming response engine: issues the upstream "stream
//! assist" call, parses the concatenated JSON-array response with
//! `json_stream`, splits thought/answer tokens, and collects generated
//! media references for post-stream download.
//!
//! Events are forwarded live to an optional sink as they are parsed off
//! the byte stream, matching the upstream's own incremental behavior --
//! a streaming caller sees deltas as they close, not after the whole
//! attempt has buffered. A retried attempt on a different account still
//! re-emits its own role/content chunks from the top, the same as the
//! upstream does on every fresh `stream_chat` call.

use std::collections::HashMap;
use std::time::Duration;

use acctrelay_core::model::QuotaClass;
use futures_util::StreamExt;

use crate::error::GatewayError;
use crate::http_clients::TrafficClient;
use crate::json_stream::JsonArrayStreamParser;
use crate::models::tools_spec_for_model;
use crate::normalizer::InlineImage;

const UPSTREAM_CALL_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub enum AttemptEvent {
    Reasoning(String),
    Content(String),
    File { file_id: String, mime_type: String },
}

#[derive(Debug, Clone, Default)]
pub struct AttemptResult {
    pub events: Vec<AttemptEvent>,
    /// The upstream may rename the session mid-stream; the
    /// orchestrator must persist whatever the last value observed was.
    pub latest_session: Option<String>,
}

fn timezone_code() -> &'static str {
    "Asia/Shanghai"
}

fn build_stream_assist_body(
    session_path: &str,
    query_text: &str,
    file_ids: &[String],
    model_id: &str,
) -> serde_json::Value {
    serde_json::json!({
        "session": session_path,
        "queryParts": [{"text": query_text}],
        "fileIds": file_ids,
        "toolsSpec": tools_spec_for_model(model_id),
        "languageCode": "en-US",
        "timeZone": timezone_code(),
        "assistGenerationConfig": {"modelId": model_id},
    })
}

/// An element carrying `{error:{code,status,message}}` is
/// promoted to a failure; 429/`RESOURCE_EXHAUSTED` routes through the
/// quota state machine, everything else is a generic upstream error.
fn in_band_error(value: &serde_json::Value) -> Option<GatewayError> {
    let error = value.get("error")?;
    let code = error.get("code").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    let status = error.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
    if code == 429 || status.contains("RESOURCE_EXHAUSTED") {
        Some(GatewayError::AccountRateLimited {
            resource_exhausted: status.contains("RESOURCE_EXHAUSTED"),
        })
    } else if code != 0 {
        Some(GatewayError::UpstreamServerError(code))
    } else {
        Some(GatewayError::StreamParseError(message.to_string()))
    }
}

/// Walks `streamAssistResponse.answer.replies[].groundedContent.content`.
fn extract_events(value: &serde_json::Value, events: &mut Vec<AttemptEvent>, latest_session: &mut Option<String>) {
    if let Some(session) = value
        .get("streamAssistResponse")
        .and_then(|s| s.get("sessionInfo"))
        .and_then(|s| s.get("session"))
        .and_then(|s| s.as_str())
    {
        *latest_session = Some(session.to_string());
    }

    let Some(replies) = value
        .get("streamAssistResponse")
        .and_then(|r| r.get("answer"))
        .and_then(|a| a.get("replies"))
        .and_then(|r| r.as_array())
    else {
        return;
    };

    for reply in replies {
        let Some(content) = reply.get("groundedContent").and_then(|g| g.get("content")) else {
            continue;
        };
        if let Some(text) = content.get("text").and_then(|t| t.as_str()) {
            let is_thought = content.get("thought").and_then(|t| t.as_bool()).unwrap_or(false);
            if is_thought {
                events.push(AttemptEvent::Reasoning(text.to_string()));
            } else {
                events.push(AttemptEvent::Content(text.to_string()));
            }
        }
        if let Some(file) = content.get("file") {
            let file_id = file.get("fileId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let mime_type = file.get("mimeType").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if !file_id.is_empty() {
                events.push(AttemptEvent::File { file_id, mime_type });
            }
        }
    }
}

/// Runs one upstream stream-assist call to completion. Every event is
/// still collected into the returned `AttemptResult` (the non-streaming
/// caller and the full-context retry transcript both need the whole
/// thing), but if `on_event` is given it also sees each event the moment
/// it is parsed, before the next chunk even arrives. `quota_class` is
/// accepted purely so callers don't have to re-derive it from `model_id`
/// at the call site.
pub async fn run_stream_assist(
    client: &TrafficClient,
    upstream_base: &str,
    jwt: &str,
    session_path: &str,
    query_text: &str,
    file_ids: &[String],
    model_id: &str,
    _quota_class: QuotaClass,
    mut on_event: Option<&mut dyn FnMut(&AttemptEvent)>,
) -> Result<AttemptResult, GatewayError> {
    let url = format!("{upstream_base}/v1alpha/locations/global/widgetStreamAssist");
    let body = build_stream_assist_body(session_path, query_text, file_ids, model_id);

    let response = client
        .request(reqwest::Method::POST, &url)
        .bearer_auth(jwt)
        .json(&body)
        .timeout(Duration::from_secs(UPSTREAM_CALL_TIMEOUT_SECS))
        .send()
        .await
        .map_err(GatewayError::from)?;

    let status = response.status();
    if !status.is_success() {
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::AccountRateLimited {
                resource_exhausted: text.contains("RESOURCE_EXHAUSTED"),
            });
        }
        return Err(GatewayError::UpstreamServerError(status.as_u16()));
    }

    let mut parser = JsonArrayStreamParser::new();
    let mut result = AttemptResult::default();
    let mut byte_stream = response.bytes_stream();
    // Carries any trailing bytes of a UTF-8 sequence split across a chunk
    // boundary forward to the next chunk, so the parser only ever sees
    // complete characters.
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(GatewayError::from)?;
        pending.extend_from_slice(&chunk);

        let valid_len = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(err) => err.valid_up_to(),
        };
        let remainder = pending.split_off(valid_len);
        let text = String::from_utf8(pending).expect("valid_up_to guarantees valid UTF-8 prefix");
        pending = remainder;

        let before = result.events.len();
        for value in parser.feed(&text) {
            if let Some(err) = in_band_error(&value) {
                return Err(err);
            }
            extract_events(&value, &mut result.events, &mut result.latest_session);
        }
        if let Some(sink) = on_event.as_deref_mut() {
            for event in &result.events[before..] {
                sink(event);
            }
        }
    }

    if !pending.is_empty() {
        // Best-effort: a non-empty leftover here means the upstream closed
        // the connection mid-sequence, which `json_stream`'s own
        // incompleteness would already have surfaced via `EmptyResponse`
        // or a parse error on the next attempt.
        log::warn!(
            "event=stream_trailing_bytes_discarded bytes={}",
            pending.len()
        );
    }

    if result.events.is_empty() {
        return Err(GatewayError::EmptyResponse);
    }
    Ok(result)
}

/// Flattens buffered events into the plain content string the
/// non-streaming `/v1/chat/completions` response and the full-context
/// retry transcript both need.
pub fn collect_content(events: &[AttemptEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            AttemptEvent::Content(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn collect_files(events: &[AttemptEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            AttemptEvent::File { file_id, mime_type } => Some((file_id.clone(), mime_type.clone())),
            _ => None,
        })
        .collect()
}

/// No upstream wire shape for session creation is given anywhere else
/// in this codebase, so this follows the same `{upstream_base}/v1alpha/...`
/// resource layout the stream-assist and JWT endpoints use; see DESIGN.md.
pub async fn create_session(
    client: &TrafficClient,
    upstream_base: &str,
    jwt: &str,
) -> Result<String, GatewayError> {
    let url = format!("{upstream_base}/v1alpha/locations/global/sessions");
    let response = client
        .request(reqwest::Method::POST, &url)
        .bearer_auth(jwt)
        .json(&serde_json::json!({}))
        .timeout(Duration::from_secs(UPSTREAM_CALL_TIMEOUT_SECS))
        .send()
        .await
        .map_err(GatewayError::from)?;
    if !response.status().is_success() {
        return Err(GatewayError::UpstreamServerError(response.status().as_u16()));
    }
    let body: serde_json::Value = response.json().await.map_err(GatewayError::from)?;
    body.get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::StreamParseError("session create response missing name".to_string()))
}

/// Uploads one inline image so it can be referenced by id in `fileIds`
/// (see `create_session` doc comment on the assumed wire shape).
pub async fn upload_file(
    client: &TrafficClient,
    upstream_base: &str,
    jwt: &str,
    session_path: &str,
    image: &InlineImage,
) -> Result<String, GatewayError> {
    let url = format!("{upstream_base}/v1alpha/{session_path}/files");
    let response = client
        .request(reqwest::Method::POST, &url)
        .bearer_auth(jwt)
        .header(reqwest::header::CONTENT_TYPE, image.mime.clone())
        .body(image.bytes.clone())
        .timeout(Duration::from_secs(UPSTREAM_CALL_TIMEOUT_SECS))
        .send()
        .await
        .map_err(GatewayError::from)?;
    if !response.status().is_success() {
        return Err(GatewayError::UpstreamServerError(response.status().as_u16()));
    }
    let body: serde_json::Value = response.json().await.map_err(GatewayError::from)?;
    body.get("fileId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::StreamParseError("file upload response missing fileId".to_string()))
}

/// Fetches session-file metadata once, giving the authoritative mime
/// type and correct session path per fileId.
pub async fn fetch_session_file_metadata(
    client: &TrafficClient,
    upstream_base: &str,
    jwt: &str,
    session_path: &str,
    file_ids: &[String],
) -> Result<HashMap<String, (String, String)>, GatewayError> {
    if file_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let url = format!("{upstream_base}/v1alpha/{session_path}/files:batchGet");
    let response = client
        .request(reqwest::Method::GET, &url)
        .bearer_auth(jwt)
        .query(&[("fileIds", file_ids.join(","))])
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(GatewayError::from)?;
    if !response.status().is_success() {
        return Err(GatewayError::UpstreamServerError(response.status().as_u16()));
    }
    let body: serde_json::Value = response.json().await.map_err(GatewayError::from)?;
    let mut out = HashMap::new();
    if let Some(files) = body.get("files").and_then(|f| f.as_array()) {
        for file in files {
            let Some(file_id) = file.get("fileId").and_then(|v| v.as_str()) else {
                continue;
            };
            let mime_type = file.get("mimeType").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let path = file
                .get("sessionPath")
                .and_then(|v| v.as_str())
                .unwrap_or(session_path)
                .to_string();
            out.insert(file_id.to_string(), (mime_type, path));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_events_splits_thought_and_answer_text() {
        let value = serde_json::json!({
            "streamAssistResponse": {
                "sessionInfo": {"session": "projects/p/sessions/s1"},
                "answer": {
                    "replies": [
                        {"groundedContent": {"content": {"text": "thinking...", "thought": true}}},
                        {"groundedContent": {"content": {"text": "hello"}}},
                        {"groundedContent": {"content": {"file": {"fileId": "f1", "mimeType": "image/png"}}}},
                    ]
                }
            }
        });
        let mut events = Vec::new();
        let mut session = None;
        extract_events(&value, &mut events, &mut session);
        assert_eq!(session.as_deref(), Some("projects/p/sessions/s1"));
        assert!(matches!(events[0], AttemptEvent::Reasoning(ref t) if t == "thinking..."));
        assert!(matches!(events[1], AttemptEvent::Content(ref t) if t == "hello"));
        assert!(matches!(events[2], AttemptEvent::File { ref file_id, .. } if file_id == "f1"));
    }

    #[test]
    fn in_band_error_routes_resource_exhausted_to_rate_limit() {
        let value = serde_json::json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota"}});
        let err = in_band_error(&value).expect("error");
        assert!(matches!(err, GatewayError::AccountRateLimited { resource_exhausted: true }));
    }

    #[test]
    fn in_band_error_passes_through_generic_status() {
        let value = serde_json::json!({"error": {"code": 500, "status": "INTERNAL", "message": "boom"}});
        let err = in_band_error(&value).expect("error");
        assert!(matches!(err, GatewayError::UpstreamServerError(500)));
    }

    #[test]
    fn collect_content_joins_only_content_events() {
        let events = vec![
            AttemptEvent::Reasoning("skip".to_string()),
            AttemptEvent::Content("a".to_string()),
            AttemptEvent::Content("b".to_string()),
        ];
        assert_eq!(collect_content(&events), "ab");
    }
}
