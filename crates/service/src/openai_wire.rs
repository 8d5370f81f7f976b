//! OpenAI chat-completion wire shapes: the inbound request body and
//! the outbound SSE chunk / non-streaming completion object.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "reasoning_content")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

impl ChatCompletionChunk {
    pub fn role_chunk(id: &str, model: &str, created: i64) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant"),
                    content: None,
                    reasoning_content: None,
                },
                finish_reason: None,
            }],
        }
    }

    pub fn content_delta(id: &str, model: &str, created: i64, content: String) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content),
                    reasoning_content: None,
                },
                finish_reason: None,
            }],
        }
    }

    pub fn reasoning_delta(id: &str, model: &str, created: i64, reasoning: String) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: None,
                    reasoning_content: Some(reasoning),
                },
                finish_reason: None,
            }],
        }
    }

    pub fn finish_chunk(id: &str, model: &str, created: i64) -> Self {
        ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                },
                finish_reason: Some("stop"),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NonStreamChoice {
    pub index: u32,
    pub message: serde_json::Value,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<NonStreamChoice>,
}

impl ChatCompletionResponse {
    pub fn new(id: String, model: String, created: i64, content: String) -> Self {
        ChatCompletionResponse {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![NonStreamChoice {
                index: 0,
                message: serde_json::json!({"role": "assistant", "content": content}),
                finish_reason: "stop",
            }],
        }
    }
}

pub fn chunk_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
