//! Model provider abstractions.
//!
//! Defines the [`Provider`] trait, the [`ChatMessage`] type, and the
//! factory that turns a [`ProviderEntry`](crate::config::ProviderEntry)
//! into a concrete backend ([`OpenAiProvider`], [`LocalProvider`],
//! [`CliProvider`]).

pub mod cli;
pub mod keys;
pub mod local;
pub mod openai;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ProviderEntry, ProviderKind};

pub use cli::CliProvider;
pub use local::LocalProvider;
pub use openai::OpenAiProvider;

// ---------------------------------------------------------------------------
// Action – what a caller needs a provider for
// ---------------------------------------------------------------------------

/// Abstract action a provider is selected for. Routing tables map these
/// to provider ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Chat,
    Tools,
    Embeddings,
    Summary,
    Subagent,
    ParentForCli,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Chat => "chat",
            Action::Tools => "tools",
            Action::Embeddings => "embeddings",
            Action::Summary => "summary",
            Action::Subagent => "subagent",
            Action::ParentForCli => "parentForCli",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Action::Chat),
            "tools" => Ok(Action::Tools),
            "embeddings" => Ok(Action::Embeddings),
            "summary" => Ok(Action::Summary),
            "subagent" => Ok(Action::Subagent),
            "parentForCli" => Ok(Action::ParentForCli),
            other => anyhow::bail!("unknown action: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatMessage – shared message representation
// ---------------------------------------------------------------------------

/// A single chat message with a role and content.
///
/// Optionally carries OpenAI tool-calling metadata so that `tool` role
/// messages and assistant `tool_calls` responses are serialised
/// correctly for the API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// For assistant messages that invoke tools: the raw OpenAI-format
    /// `tool_calls` array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
    /// For `role: "tool"` messages: the id of the tool call this result
    /// corresponds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain message (no tool metadata).
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// A `role: "tool"` message carrying a tool-call result.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Serialise a slice of [`ChatMessage`]s into the OpenAI-compatible
/// JSON array format, including `tool_calls` and `tool_call_id` when
/// present.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({ "role": m.role });
            if let Some(ref tcs) = m.tool_calls {
                msg["tool_calls"] = serde_json::json!(tcs);
                // The API expects content to be null on assistant
                // messages that carry tool_calls.
                if m.content.is_empty() {
                    msg["content"] = serde_json::Value::Null;
                } else {
                    msg["content"] = serde_json::json!(m.content);
                }
            } else {
                msg["content"] = serde_json::json!(m.content);
            }
            if let Some(ref tcid) = m.tool_call_id {
                msg["tool_call_id"] = serde_json::json!(tcid);
            }
            msg
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Chat options / response
// ---------------------------------------------------------------------------

/// Per-call options for [`Provider::chat`].
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Tool definitions in the OpenAI `tools` format.
    pub tools: Vec<serde_json::Value>,
    /// `"auto"`, `"none"`, or a forced tool name.
    pub tool_choice: Option<String>,
    /// Reasoning level; anything other than `"off"` is forwarded to
    /// backends that understand it.
    pub thinking: Option<String>,
    /// Per-call deadline.
    pub timeout: Option<std::time::Duration>,
    /// Action the caller routed on; providers use it to pick the
    /// per-role model override.
    pub action: Option<Action>,
}

/// Token usage statistics returned by the API.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single tool call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Tool-call id assigned by the API (synthesised when absent).
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments string.
    pub arguments: String,
}

/// Response from one [`Provider::chat`] call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Assistant text (may be empty when tool calls are present).
    pub content: String,
    /// Parsed tool calls, in request order.
    pub tool_calls: Vec<ToolCallRequest>,
    /// The raw `tool_calls` array, preserved so the assistant message
    /// can be echoed back verbatim on the next iteration.
    pub raw_tool_calls: Option<Vec<serde_json::Value>>,
    /// Model the backend reports having used.
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Extract token usage statistics from an OpenAI-style response JSON.
pub fn parse_token_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Parse `tool_calls` from an OpenAI-style chat completion response.
pub fn parse_tool_calls(message: &serde_json::Value) -> Vec<ToolCallRequest> {
    let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    tool_calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func
                .get("arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}")
                .to_string();
            let id = tc
                .get("id")
                .and_then(|i| i.as_str())
                .map(String::from)
                .unwrap_or_else(crate::utils::generate_nonce);
            Some(ToolCallRequest { id, name, arguments })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("id", &self.id()).finish()
    }
}

/// Trait implemented by every backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry id of this provider instance.
    fn id(&self) -> &str;

    /// Default model name.
    fn model(&self) -> &str;

    /// Model used for a specific action, falling back to the default.
    fn model_for(&self, _action: Action) -> &str {
        self.model()
    }

    /// Whether this backend can participate in tool-call loops.
    /// Subprocess CLIs cannot.
    fn supports_tools(&self) -> bool {
        true
    }

    /// Context window in tokens, when known. Drives the engine's
    /// compaction guard.
    fn context_window(&self) -> Option<usize> {
        None
    }

    /// Send a sequence of chat messages and return the reply.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse>;

    /// Cheap liveness probe. Never raises; any failure is `false`.
    async fn health(&self) -> bool;

    /// Generate embedding vectors for the given texts, in input order.
    ///
    /// Returns `None` when the backend has no embeddings support.
    async fn embed(&self, _texts: &[&str]) -> anyhow::Result<Option<Vec<Vec<f32>>>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Construct the concrete provider variant for a config entry.
///
/// Fails with `invalid_config` when the variant's mandatory fields are
/// missing: `openai` requires a non-empty `base_url`; `cli` requires a
/// command (defaulted from `cli_provider` when possible).
pub fn build_provider(id: &str, entry: &ProviderEntry) -> anyhow::Result<Arc<dyn Provider>> {
    match entry.kind {
        ProviderKind::Openai => {
            let base_url = entry
                .base_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| anyhow::anyhow!("invalid_config: openai provider {id} requires base_url"))?;
            Ok(Arc::new(OpenAiProvider::new(id, base_url, entry)?))
        }
        ProviderKind::Local => {
            let base_url = entry
                .base_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .unwrap_or("http://127.0.0.1:11434");
            Ok(Arc::new(LocalProvider::new(id, base_url, entry)))
        }
        ProviderKind::Cli => Ok(Arc::new(CliProvider::new(id, entry)?)),
    }
}
