use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};

use lmbridge_core::config;
use lmbridge_core::storage::now_ts;

use crate::strategies::UpstreamRequest;

const UPSTREAM_STREAM_PATH: &str = "/nextjs-api/stream/create-evaluation";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, String> {
    let request: ChatRequest =
        serde_json::from_slice(body).map_err(|err| format!("invalid chat request: {err}"))?;
    if request.model.trim().is_empty() {
        return Err("invalid chat request: empty model".to_string());
    }
    if request.messages.is_empty() {
        return Err("invalid chat request: empty messages".to_string());
    }
    Ok(request)
}

/// Shapes the upstream call for the acquisition strategies. The strategies
/// decide how the URL is actually reached (same-origin in-page fetch or
/// absolute), so the absolute form goes in here.
pub fn build_upstream_request(chat: &ChatRequest) -> UpstreamRequest {
    let messages: Vec<Value> = chat
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": flatten_content(&message.content),
            })
        })
        .collect();
    UpstreamRequest {
        method: "POST".to_string(),
        url: format!("{}{}", config::upstream_base_url(), UPSTREAM_STREAM_PATH),
        payload: json!({
            "model": chat.model,
            "messages": messages,
        }),
    }
}

/// Callers following the newer message shape send content as an array of
/// typed parts; the upstream wants one plain string.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    }
}

pub fn new_completion_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(9 + bytes.len() * 2);
    id.push_str("chatcmpl-");
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn sse_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// First stream chunk: role announcement with an empty delta body.
pub fn sse_initial_chunk(id: &str, model: &str) -> String {
    sse_frame(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": now_ts(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "content": "" },
            "finish_reason": Value::Null,
        }],
    }))
}

pub fn sse_content_chunk(id: &str, model: &str, delta: &str) -> String {
    sse_frame(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": now_ts(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": { "content": delta },
            "finish_reason": Value::Null,
        }],
    }))
}

pub fn sse_finish_chunk(id: &str, model: &str, finish_reason: &str) -> String {
    sse_frame(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": now_ts(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": finish_reason,
        }],
    }))
}

/// Non-streaming response body. Token accounting is not available from the
/// upstream stream, so usage is reported as zeros rather than guessed.
pub fn completion_body(id: &str, model: &str, content: &str, finish_reason: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": now_ts(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        },
    })
}
