//! OpenAI-compatible HTTP provider.
//!
//! Works with any API that implements the OpenAI chat completions
//! interface: hosted gateways, LM Studio, vLLM, OpenRouter, etc.
//!
//! Config example:
//! ```yaml
//! providers:
//!   lmstudio:
//!     type: openai
//!     base_url: http://127.0.0.1:1234/v1
//!     model: qwen2.5
//!     api_key: $LMSTUDIO_KEY   # optional, local servers need none
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::keys::{resolve_api_key, AuthProfilePool};
use super::{
    parse_token_usage, parse_tool_calls, serialize_messages, Action, ChatMessage, ChatOptions,
    ChatResponse, Provider,
};
use crate::config::{ModelRoles, ProviderEntry};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Provider that talks to an OpenAI-compatible chat completions API.
#[derive(Debug)]
pub struct OpenAiProvider {
    id: String,
    base_url: String,
    /// Static key resolved at construction; `None` for keyless servers.
    api_key: Option<String>,
    /// Rotating key pool; takes precedence over `api_key` when
    /// non-empty.
    auth_pool: AuthProfilePool,
    model: String,
    models: ModelRoles,
    embeddings_model: Option<String>,
    context_window: Option<usize>,
    health_timeout: Duration,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(id: &str, base_url: &str, entry: &ProviderEntry) -> anyhow::Result<Self> {
        let api_key = match entry.api_key.as_deref() {
            Some(reference) if !reference.is_empty() => Some(resolve_api_key(reference)?),
            _ => None,
        };
        Ok(Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            auth_pool: AuthProfilePool::new(entry.auth_profiles.clone()),
            model: entry.model.clone(),
            models: entry.models.clone(),
            embeddings_model: entry.embeddings_model.clone(),
            context_window: entry.context_window,
            health_timeout: entry
                .health_check_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HEALTH_TIMEOUT),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        })
    }

    /// Pick the bearer key for this call: pool first, static second.
    /// Returns `(profile index, key)` so auth failures can bench the
    /// profile.
    fn pick_key(&self) -> Option<(Option<usize>, String)> {
        if let Some((idx, key)) = self.auth_pool.current() {
            return Some((Some(idx), key));
        }
        self.api_key.clone().map(|k| (None, k))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> Option<usize> {
        self.context_window
    }

    fn model_for(&self, action: Action) -> &str {
        let role = match action {
            Action::Chat => self.models.chat.as_deref(),
            Action::Tools => self.models.tools.as_deref(),
            Action::Embeddings => self.models.embeddings.as_deref(),
            Action::Summary => self.models.summary.as_deref(),
            Action::Subagent => self.models.subagent.as_deref(),
            Action::ParentForCli => None,
        };
        role.unwrap_or(&self.model)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let model = options
            .action
            .map(|a| self.model_for(a))
            .unwrap_or(&self.model);

        let mut body = json!({
            "model": model,
            "messages": serialize_messages(messages),
            "temperature": options.temperature.unwrap_or(0.7),
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !options.tools.is_empty() {
            body["tools"] = json!(options.tools);
            body["tool_choice"] = json!(options.tool_choice.as_deref().unwrap_or("auto"));
        }
        if let Some(thinking) = options.thinking.as_deref() {
            if thinking != "off" {
                body["reasoning"] = json!({ "effort": thinking });
            }
        }

        let key = self.pick_key();
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(options.timeout.unwrap_or(DEFAULT_CHAT_TIMEOUT))
            .json(&body);
        if let Some((_, ref k)) = key {
            req = req.bearer_auth(k);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            if matches!(status.as_u16(), 401 | 403) {
                if let Some((Some(idx), _)) = key {
                    self.auth_pool.mark_auth_failure(idx);
                }
            }
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider {} returned {}: {}",
                self.id,
                status.as_u16(),
                crate::utils::truncate_str(&text, 500)
            );
        }

        let json: serde_json::Value = resp.json().await?;
        let message = &json["choices"][0]["message"];
        let tool_calls = parse_tool_calls(message);
        let raw_tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .cloned();

        Ok(ChatResponse {
            content: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls,
            raw_tool_calls,
            model: json["model"].as_str().map(String::from),
            usage: parse_token_usage(&json),
        })
    }

    async fn health(&self) -> bool {
        let mut req = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(self.health_timeout);
        if let Some((_, ref k)) = self.pick_key() {
            req = req.bearer_auth(k);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(provider_id = %self.id, error = %e, "health probe failed");
                false
            }
        }
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Option<Vec<Vec<f32>>>> {
        let model = self
            .embeddings_model
            .as_deref()
            .unwrap_or_else(|| self.model_for(Action::Embeddings));
        let body = json!({ "model": model, "input": texts });

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .timeout(DEFAULT_CHAT_TIMEOUT)
            .json(&body);
        if let Some((_, ref k)) = self.pick_key() {
            req = req.bearer_auth(k);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider {} returned {}: {}",
                self.id,
                status.as_u16(),
                crate::utils::truncate_str(&text, 500)
            );
        }

        let json: serde_json::Value = resp.json().await?;
        let Some(data) = json["data"].as_array() else {
            anyhow::bail!("provider {}: embeddings response missing data array", self.id);
        };

        // Vectors come back with an index field; return them in input
        // order regardless of response order.
        let mut rows: Vec<(usize, Vec<f32>)> = data
            .iter()
            .filter_map(|item| {
                let idx = item["index"].as_u64()? as usize;
                let vec = item["embedding"]
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect();
                Some((idx, vec))
            })
            .collect();
        rows.sort_by_key(|(idx, _)| *idx);

        Ok(Some(rows.into_iter().map(|(_, v)| v).collect()))
    }
}
