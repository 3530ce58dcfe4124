//! OpenAI-compatible wire types and endpoint helpers.

use serde::{Deserialize, Serialize};

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

// -- Request ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Sampling parameters shared by every request the process sends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for Sampling {
    fn default() -> Self {
        Sampling {
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl ChatRequest {
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>, sampling: Sampling) -> Self {
        ChatRequest {
            model: model.into(),
            messages,
            stream: true,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
        }
    }
}

/// Where a request goes: full URL, model and optional bearer credential.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointTarget {
    pub url: String,
    pub model: String,
    pub credential: Option<String>,
}

impl EndpointTarget {
    pub fn new(base_url: &str, model: impl Into<String>, credential: Option<String>) -> Self {
        EndpointTarget {
            url: completions_url(base_url),
            model: model.into(),
            credential: credential.filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Strip one trailing slash and append `/chat/completions` unless already present.
pub fn completions_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    let base = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if base.ends_with(CHAT_COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{base}{CHAT_COMPLETIONS_PATH}")
    }
}

// -- SSE chunk ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Option<StreamDelta>,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// `choices[0].delta.content`, when present.
    pub fn into_content(self) -> Option<String> {
        self.choices.into_iter().next()?.delta?.content
    }
}

// -- Error body -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<ProviderErrorDetail>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

/// Human-readable reason for a non-success response.
///
/// Prefers `error.message`, then `detail`, then the raw body, then a generic
/// status line when the body is empty.
pub fn error_detail(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ProviderErrorBody>(body) {
        if let Some(msg) = parsed.error.and_then(|e| e.message).filter(|m| !m.is_empty()) {
            return msg;
        }
        match parsed.detail {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return s,
            Some(serde_json::Value::Null) | None => {}
            Some(other) => return other.to_string(),
        }
    }
    if body.is_empty() {
        format!("Request failed with status {status}")
    } else {
        body.to_string()
    }
}
