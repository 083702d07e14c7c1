//! Agent engine: one model turn with a tool-call loop.
//!
//! [`AgentEngine::execute`] builds the prompt, selects a provider
//! through the [`ProviderManager`], and loops over tool calls until
//! the model produces a final reply. Provider failures are recorded on
//! the circuit breaker and the engine fails over once per iteration
//! before surfacing the error. A context-window guard compacts older
//! history through the `summary`-routed provider.

pub mod history;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub use history::HistoryStore;

use crate::config::{EngineConfig, ToolPolicyConfig};
use crate::failover::classify;
use crate::manager::{ProviderManager, SelectOptions};
use crate::providers::{Action, ChatMessage, ChatOptions, Provider};

/// Messages loaded into a turn before the new query.
const HISTORY_WINDOW: usize = 40;

/// Rough chars-per-token estimate for the compaction guard.
const CHARS_PER_TOKEN: usize = 4;

/// Context window assumed when the provider does not declare one.
const DEFAULT_CONTEXT_WINDOW: usize = 32_768;

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

/// Supplier of the system prompt (external prompt builder).
#[async_trait]
pub trait PromptBuilder: Send + Sync {
    async fn build(&self, session_key: &str, channel: &str) -> anyhow::Result<String>;
}

/// Fixed-text prompt builder; the production bootstrap loader is an
/// external collaborator.
pub struct StaticPromptBuilder(pub String);

#[async_trait]
impl PromptBuilder for StaticPromptBuilder {
    async fn build(&self, _session_key: &str, _channel: &str) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Opaque memory supplier; snippets are appended to the system prompt.
#[async_trait]
pub trait MemorySearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Policy group this tool belongs to (`"general"` by default).
    fn group(&self) -> &str {
        "general"
    }

    fn description(&self) -> &str;

    /// JSON-schema of the arguments object.
    fn parameters(&self) -> serde_json::Value;

    async fn run(&self, arguments: serde_json::Value) -> anyhow::Result<String>;
}

/// Registry of tools keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI-format `tools` array for the permitted subset.
    pub fn definitions(&self, policy: &ToolPolicyConfig) -> Vec<serde_json::Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| {
                let tool = &self.tools[name];
                if !policy_allows_tool(policy, tool.as_ref()) {
                    return None;
                }
                Some(serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                }))
            })
            .collect()
    }
}

/// Group/tool gate shared by definitions and execution.
fn policy_allows_tool(policy: &ToolPolicyConfig, tool: &dyn Tool) -> bool {
    if policy.deny_tools.iter().any(|t| t == tool.name()) {
        return false;
    }
    if policy.deny_groups.iter().any(|g| g == tool.group()) {
        return false;
    }
    if !policy.allow_tools.is_empty() && !policy.allow_tools.iter().any(|t| t == tool.name()) {
        return false;
    }
    if !policy.allow_groups.is_empty() && !policy.allow_groups.iter().any(|g| g == tool.group()) {
        return false;
    }
    true
}

/// Channel/model/audience gate evaluated per turn.
fn policy_allows_context(
    policy: &ToolPolicyConfig,
    channel: &str,
    model: &str,
    audience: Option<&str>,
) -> bool {
    if !policy.allow_channels.is_empty() && !policy.allow_channels.iter().any(|c| c == channel) {
        return false;
    }
    if !policy.allow_models.is_empty() && !policy.allow_models.iter().any(|m| m == model) {
        return false;
    }
    if !policy.allow_audiences.is_empty() {
        match audience {
            Some(a) if policy.allow_audiences.iter().any(|x| x == a) => {}
            _ => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// AgentEngine
// ---------------------------------------------------------------------------

/// Request for one agent turn.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub session_key: String,
    pub query: String,
    pub channel: String,
    pub chat_id: Option<String>,
    pub audience: Option<String>,
}

/// Result of one agent turn.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub response: String,
    pub provider_id: String,
    pub model: String,
}

/// Executes single agent turns against the provider pool.
pub struct AgentEngine {
    manager: Arc<ProviderManager>,
    tools: ToolRegistry,
    cfg: EngineConfig,
    history: HistoryStore,
    prompt_builder: Arc<dyn PromptBuilder>,
    memory: Option<Arc<dyn MemorySearch>>,
}

impl AgentEngine {
    pub fn new(
        manager: Arc<ProviderManager>,
        tools: ToolRegistry,
        cfg: EngineConfig,
        history_dir: &Path,
        prompt_builder: Arc<dyn PromptBuilder>,
    ) -> Self {
        Self {
            manager,
            tools,
            cfg,
            history: HistoryStore::new(history_dir),
            prompt_builder,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySearch>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Whether any provider is selectable for chat right now.
    pub async fn has_healthy_provider(&self) -> bool {
        self.manager.has_healthy_provider().await
    }

    /// Run one agent turn for a session.
    pub async fn execute(&self, req: EngineRequest) -> anyhow::Result<EngineResponse> {
        let mut system = self
            .prompt_builder
            .build(&req.session_key, &req.channel)
            .await?;
        if let Some(memory) = &self.memory {
            match memory.search(&req.query, 5).await {
                Ok(snippets) if !snippets.is_empty() => {
                    system.push_str("\n\nRelevant memory:\n");
                    for snippet in snippets {
                        system.push_str("- ");
                        system.push_str(&snippet);
                        system.push('\n');
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "memory search failed, continuing without"),
            }
        }

        let mut messages = vec![ChatMessage::new("system", system)];
        messages.extend(self.history.load(&req.session_key, HISTORY_WINDOW).await?);
        let user_msg = ChatMessage::new("user", req.query.clone());
        messages.push(user_msg.clone());
        self.history.append(&req.session_key, &user_msg).await?;

        let tools_disabled = crate::utils::env_flag("ANT_DISABLE_PROVIDER_TOOLS");
        let mut provider = self
            .manager
            .select_best(
                Action::Chat,
                SelectOptions {
                    require_tools: !self.tools.is_empty() && !tools_disabled,
                    ..SelectOptions::default()
                },
            )
            .await?;

        let tool_defs = if tools_disabled
            || !policy_allows_context(
                &self.cfg.tool_policy,
                &req.channel,
                provider.model(),
                req.audience.as_deref(),
            ) {
            Vec::new()
        } else {
            self.tools.definitions(&self.cfg.tool_policy)
        };

        let mut final_content: Option<String> = None;
        for iteration in 0..self.cfg.max_tool_iterations {
            self.maybe_compact(&req.session_key, provider.as_ref(), &mut messages)
                .await;

            let options = ChatOptions {
                tools: tool_defs.clone(),
                tool_choice: (!tool_defs.is_empty()).then(|| "auto".to_string()),
                timeout: Some(Duration::from_millis(self.cfg.per_iteration_timeout_ms)),
                action: Some(Action::Chat),
                ..ChatOptions::default()
            };

            let response = match provider.chat(&messages, &options).await {
                Ok(r) => r,
                Err(e) => {
                    let reason = classify(&e);
                    self.manager
                        .record_failure(provider.id(), Some(reason))
                        .await;
                    warn!(
                        provider_id = provider.id(),
                        reason = reason.as_str(),
                        error = %e,
                        "provider call failed, attempting failover"
                    );
                    // One failover attempt per iteration.
                    provider = self
                        .manager
                        .select_best(
                            Action::Chat,
                            SelectOptions {
                                require_tools: !tool_defs.is_empty(),
                                ..SelectOptions::default()
                            },
                        )
                        .await
                        .map_err(|_| e)?;
                    provider.chat(&messages, &options).await?
                }
            };

            if !response.has_tool_calls() {
                final_content = Some(response.content);
                break;
            }

            let assistant = ChatMessage {
                role: "assistant".into(),
                content: response.content.clone(),
                tool_calls: response.raw_tool_calls.clone(),
                tool_call_id: None,
            };
            messages.push(assistant);

            for call in &response.tool_calls {
                let result = self
                    .run_tool(&req, provider.model(), &call.name, &call.arguments)
                    .await;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
            debug!(
                iteration,
                calls = response.tool_calls.len(),
                "tool iteration complete"
            );
        }

        let content = final_content
            .unwrap_or_else(|| "I could not complete the request within the tool budget.".into());

        let was_recovering = self.manager.record_success(provider.id()).await;
        if was_recovering {
            info!(provider_id = provider.id(), "provider back in rotation");
        }
        let assistant_msg = ChatMessage::new("assistant", content.clone());
        self.history.append(&req.session_key, &assistant_msg).await?;

        Ok(EngineResponse {
            response: content,
            provider_id: provider.id().to_string(),
            model: provider.model_for(Action::Chat).to_string(),
        })
    }

    /// Execute one tool call under policy and timeout; all failures
    /// come back as tool-result text so the loop keeps going.
    async fn run_tool(
        &self,
        req: &EngineRequest,
        model: &str,
        name: &str,
        arguments: &str,
    ) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!("error: unknown tool {name}");
        };
        if !policy_allows_tool(&self.cfg.tool_policy, tool.as_ref())
            || !policy_allows_context(
                &self.cfg.tool_policy,
                &req.channel,
                model,
                req.audience.as_deref(),
            )
        {
            warn!(tool = name, channel = %req.channel, "tool call denied by policy");
            return format!("error: tool {name} is not permitted in this context");
        }

        let args: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => return format!("error: invalid tool arguments: {e}"),
        };

        let deadline = Duration::from_millis(self.cfg.per_tool_timeout_ms);
        match tokio::time::timeout(deadline, tool.run(args)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => format!("error: {e}"),
            Err(_) => format!("error: tool {name} timed out"),
        }
    }

    /// Compact the message list when it approaches the provider's
    /// context window: summarize everything but the newest messages
    /// through the summary-routed provider and rewrite history.
    async fn maybe_compact(
        &self,
        session_key: &str,
        provider: &dyn Provider,
        messages: &mut Vec<ChatMessage>,
    ) {
        let window = provider.context_window().unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let estimated: usize = messages
            .iter()
            .map(|m| m.content.len() / CHARS_PER_TOKEN + 4)
            .sum();
        let threshold = window * self.cfg.compaction.threshold_percent as usize / 100;
        if estimated < threshold {
            return;
        }

        let keep = self.cfg.compaction.min_recent_messages;
        // Index 0 is the system prompt; it always survives.
        if messages.len() <= keep + 1 {
            return;
        }
        let split = messages.len() - keep;
        let older: Vec<ChatMessage> = messages[1..split].to_vec();

        let transcript: String = older
            .iter()
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        let summary_req = vec![
            ChatMessage::new(
                "system",
                "Summarize the following conversation concisely, keeping decisions, open items, and facts.",
            ),
            ChatMessage::new("user", transcript),
        ];

        let summary = match self
            .manager
            .select_best(Action::Summary, SelectOptions::default())
            .await
        {
            Ok(summarizer) => {
                let options = ChatOptions {
                    action: Some(Action::Summary),
                    timeout: Some(Duration::from_millis(self.cfg.per_iteration_timeout_ms)),
                    ..ChatOptions::default()
                };
                match summarizer.chat(&summary_req, &options).await {
                    Ok(r) => Some(r.content),
                    Err(e) => {
                        warn!(error = %e, "compaction summary failed, keeping history");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "no summary provider, keeping history");
                None
            }
        };

        let Some(summary) = summary else { return };
        info!(
            session_key,
            dropped = older.len(),
            "history compacted"
        );

        let note = ChatMessage::new(
            "system",
            format!("Earlier conversation was summarized: {summary}"),
        );
        let mut compacted = vec![messages[0].clone(), note];
        compacted.extend_from_slice(&messages[split..]);
        *messages = compacted;

        // Persist the compacted shape so the next turn loads it.
        if let Err(e) = self.history.replace(session_key, &messages[1..]).await {
            warn!(error = %e, "history rewrite after compaction failed");
        }
    }
}
