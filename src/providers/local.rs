//! Local HTTP provider (Ollama-style API).
//!
//! Talks to a non-streaming `/api/chat` endpoint. Embeddings require
//! one `/api/embeddings` request per text; health is `GET /api/tags`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{serialize_messages, Action, ChatMessage, ChatOptions, ChatResponse, Provider};
use crate::config::{ModelRoles, ProviderEntry};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider for a local model server speaking the Ollama API.
pub struct LocalProvider {
    id: String,
    base_url: String,
    model: String,
    models: ModelRoles,
    embeddings_model: Option<String>,
    context_window: Option<usize>,
    health_timeout: Duration,
    client: Client,
}

impl LocalProvider {
    pub fn new(id: &str, base_url: &str, entry: &ProviderEntry) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: entry.model.clone(),
            models: entry.models.clone(),
            embeddings_model: entry.embeddings_model.clone(),
            context_window: entry.context_window,
            health_timeout: entry
                .health_check_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_HEALTH_TIMEOUT),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
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

        let body = json!({
            "model": model,
            "messages": serialize_messages(messages),
            "stream": false,
            "options": { "temperature": options.temperature.unwrap_or(0.7) },
        });

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(options.timeout.unwrap_or(DEFAULT_CHAT_TIMEOUT))
            .json(&body)
            .send()
            .await?;

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
        Ok(ChatResponse {
            content: json["message"]["content"].as_str().unwrap_or("").to_string(),
            tool_calls: Vec::new(),
            raw_tool_calls: None,
            model: json["model"].as_str().map(String::from),
            usage: None,
        })
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await
        {
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

        // This API embeds one prompt per request.
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let resp = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .timeout(DEFAULT_CHAT_TIMEOUT)
                .json(&json!({ "model": model, "prompt": text }))
                .send()
                .await?;

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
            let vec = json["embedding"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect::<Vec<f32>>()
                })
                .unwrap_or_default();
            out.push(vec);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry() -> ProviderEntry {
        ProviderEntry {
            kind: ProviderKind::Local,
            base_url: None,
            api_key: None,
            model: "llama3".into(),
            models: ModelRoles::default(),
            context_window: None,
            embeddings_model: Some("nomic-embed".into()),
            cli_provider: None,
            command: None,
            args: Vec::new(),
            health_check_timeout_ms: None,
            health_check_cache_ttl_minutes: None,
            auth_profiles: Vec::new(),
        }
    }

    #[tokio::test]
    async fn chat_posts_non_streaming_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false, "model": "llama3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama3",
                "message": {"role": "assistant", "content": "hi"}
            })))
            .mount(&server)
            .await;

        let p = LocalProvider::new("ollama", &server.uri(), &entry());
        let resp = p
            .chat(&[ChatMessage::new("user", "hello")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.model.as_deref(), Some("llama3"));
    }

    #[tokio::test]
    async fn health_hits_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        let p = LocalProvider::new("ollama", &server.uri(), &entry());
        assert!(p.health().await);
    }

    #[tokio::test]
    async fn embed_issues_one_request_per_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(serde_json::json!({"model": "nomic-embed"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": [0.1, 0.2]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let p = LocalProvider::new("ollama", &server.uri(), &entry());
        let vecs = p.embed(&["a", "b"]).await.unwrap().unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn unreachable_server_is_unhealthy() {
        let mut e = entry();
        e.base_url = Some("http://127.0.0.1:1".into());
        let p = LocalProvider::new("ollama", "http://127.0.0.1:1", &e);
        assert!(!p.health().await);
    }
}
