//! Typed configuration for the execution core.
//!
//! Loaded from `config.yaml` in the Ant home directory. Parsing and the
//! interactive setup wizard live outside the core; this module only
//! defines the shapes the core consumes and a thin loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

/// Provider kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP endpoint.
    Openai,
    /// Local HTTP endpoint (Ollama-style API).
    Local,
    /// Subprocess CLI backend.
    Cli,
}

/// Per-action model overrides for a provider entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelRoles {
    #[serde(default)]
    pub chat: Option<String>,
    #[serde(default)]
    pub tools: Option<String>,
    #[serde(default)]
    pub embeddings: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub subagent: Option<String>,
}

/// A single API-key profile in a rotating auth pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthProfile {
    /// Key value or env reference (`$X`, `${X}`, `${ENV:X}`, `env:X`).
    pub api_key: String,
    /// Human-readable label used in logs.
    #[serde(default)]
    pub label: Option<String>,
    /// Cooldown applied after an auth failure on this profile.
    #[serde(default = "default_auth_cooldown_minutes")]
    pub cooldown_minutes: u64,
}

fn default_auth_cooldown_minutes() -> u64 {
    30
}

/// Configuration for one provider id.
///
/// Invariants enforced at registration time: `openai` requires a
/// non-empty `base_url`; `cli` requires `command` (defaulted from
/// `cli_provider` when absent).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEntry {
    /// Provider variant.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// HTTP base URL (openai / local variants).
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key or env reference.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Default model name.
    pub model: String,
    /// Per-action model overrides.
    #[serde(default)]
    pub models: ModelRoles,
    /// Context window in tokens (compaction guard input).
    #[serde(default)]
    pub context_window: Option<usize>,
    /// Dedicated embeddings model, when different from `model`.
    #[serde(default)]
    pub embeddings_model: Option<String>,
    /// CLI variant name: "claude", "copilot", "codex", "kimi".
    #[serde(default)]
    pub cli_provider: Option<String>,
    /// Executable for the cli variant. Defaults from `cli_provider`.
    #[serde(default)]
    pub command: Option<String>,
    /// Argument template for the cli variant. `{prompt}` and `{output}`
    /// placeholders are substituted at call time.
    #[serde(default)]
    pub args: Vec<String>,
    /// Health probe timeout override.
    #[serde(default)]
    pub health_check_timeout_ms: Option<u64>,
    /// Health cache TTL override.
    #[serde(default)]
    pub health_check_cache_ttl_minutes: Option<u64>,
    /// Rotating auth-profile pool. When non-empty, keys rotate
    /// round-robin and cool down individually on auth failures.
    #[serde(default)]
    pub auth_profiles: Vec<AuthProfile>,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Routing and fallback configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Map of action name (chat/tools/embeddings/summary/subagent/
    /// parentForCli) to provider id.
    #[serde(default)]
    pub actions: HashMap<String, String>,
    /// Provider used when an action has no mapping.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Ordered fallback chain attempted when the routed provider is
    /// unavailable.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    /// Tier pins: "fast" and "quality" provider ids.
    #[serde(default)]
    pub tiers: HashMap<String, String>,
    /// When escalating from the fast tier, consult the quality tier
    /// before the fallback chain.
    #[serde(default = "default_true")]
    pub fallback_from_fast: bool,
}

// ---------------------------------------------------------------------------
// Circuit breaker / health
// ---------------------------------------------------------------------------

/// Circuit-breaker cooldown parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// First cooldown in milliseconds.
    #[serde(default = "default_breaker_base_ms")]
    pub base_ms: i64,
    /// Cooldown cap in milliseconds.
    #[serde(default = "default_breaker_cap_ms")]
    pub cap_ms: i64,
}

fn default_breaker_base_ms() -> i64 {
    2_000
}

fn default_breaker_cap_ms() -> i64 {
    300_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            base_ms: default_breaker_base_ms(),
            cap_ms: default_breaker_cap_ms(),
        }
    }
}

/// Health-probe settings shared by the manager's selection path.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Per-probe timeout.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a probe result stays cached.
    #[serde(default = "default_health_cache_ttl_ms")]
    pub cache_ttl_ms: i64,
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_health_cache_ttl_ms() -> i64 {
    60_000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout_ms(),
            cache_ttl_ms: default_health_cache_ttl_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task engine
// ---------------------------------------------------------------------------

/// Task persistence and queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TasksConfig {
    /// Directory holding one JSON file per task. Relative paths resolve
    /// against the Ant home directory.
    #[serde(default = "default_tasks_dir")]
    pub dir: PathBuf,
    /// Read-cache TTL for task records.
    #[serde(default = "default_task_cache_ttl_ms")]
    pub cache_ttl_ms: i64,
    /// Concurrency cap for the Main lane.
    #[serde(default = "default_main_lane")]
    pub main_concurrency: usize,
    /// Concurrency cap for the Autonomous lane.
    #[serde(default = "default_autonomous_lane")]
    pub autonomous_concurrency: usize,
    /// Concurrency cap for the Maintenance lane.
    #[serde(default = "default_maintenance_lane")]
    pub maintenance_concurrency: usize,
    /// Default per-task timeout.
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: i64,
    /// Default retry attempts for new tasks.
    #[serde(default = "default_task_max_attempts")]
    pub default_max_attempts: u32,
    /// First retry backoff.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: i64,
    /// Backoff multiplier.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Backoff cap.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: i64,
    /// Timeout-monitor scan interval.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Emit a warning event when this close to the deadline.
    #[serde(default = "default_warning_threshold_ms")]
    pub warning_threshold_ms: i64,
}

fn default_tasks_dir() -> PathBuf {
    PathBuf::from("tasks")
}

fn default_task_cache_ttl_ms() -> i64 {
    5_000
}

fn default_main_lane() -> usize {
    1
}

fn default_autonomous_lane() -> usize {
    5
}

fn default_maintenance_lane() -> usize {
    1
}

fn default_task_timeout_ms() -> i64 {
    300_000
}

fn default_task_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> i64 {
    1_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_cap_ms() -> i64 {
    60_000
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

fn default_warning_threshold_ms() -> i64 {
    30_000
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            dir: default_tasks_dir(),
            cache_ttl_ms: default_task_cache_ttl_ms(),
            main_concurrency: default_main_lane(),
            autonomous_concurrency: default_autonomous_lane(),
            maintenance_concurrency: default_maintenance_lane(),
            default_timeout_ms: default_task_timeout_ms(),
            default_max_attempts: default_task_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_cap_ms: default_retry_cap_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            warning_threshold_ms: default_warning_threshold_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent engine
// ---------------------------------------------------------------------------

/// Compaction guard settings for the agent engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    /// Compact when estimated tokens reach this share of the context
    /// window.
    #[serde(default = "default_compaction_threshold")]
    pub threshold_percent: u8,
    /// Messages always kept verbatim at the tail.
    #[serde(default = "default_min_recent")]
    pub min_recent_messages: usize,
}

fn default_compaction_threshold() -> u8 {
    80
}

fn default_min_recent() -> usize {
    6
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_percent: default_compaction_threshold(),
            min_recent_messages: default_min_recent(),
        }
    }
}

/// Tool gating for the agent engine's tool-call loop.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolPolicyConfig {
    /// Allowlist of tool groups. Empty = all groups allowed.
    #[serde(default)]
    pub allow_groups: Vec<String>,
    /// Denylist of tool groups.
    #[serde(default)]
    pub deny_groups: Vec<String>,
    /// Allowlist of tool names. Empty = all tools allowed.
    #[serde(default)]
    pub allow_tools: Vec<String>,
    /// Denylist of tool names.
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// Channels permitted to trigger tool calls. Empty = all.
    #[serde(default)]
    pub allow_channels: Vec<String>,
    /// Models permitted to trigger tool calls. Empty = all.
    #[serde(default)]
    pub allow_models: Vec<String>,
    /// Audiences permitted to trigger tool calls. Empty = all.
    #[serde(default)]
    pub allow_audiences: Vec<String>,
}

/// Agent engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Max tool-call loop iterations per turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Per-iteration provider call timeout.
    #[serde(default = "default_iteration_timeout_ms")]
    pub per_iteration_timeout_ms: u64,
    /// Per-tool execution timeout.
    #[serde(default = "default_tool_timeout_ms")]
    pub per_tool_timeout_ms: u64,
    /// Context-window compaction guard.
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Tool gating policy.
    #[serde(default)]
    pub tool_policy: ToolPolicyConfig,
}

fn default_max_tool_iterations() -> usize {
    8
}

fn default_iteration_timeout_ms() -> u64 {
    120_000
}

fn default_tool_timeout_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            per_iteration_timeout_ms: default_iteration_timeout_ms(),
            per_tool_timeout_ms: default_tool_timeout_ms(),
            compaction: CompactionConfig::default(),
            tool_policy: ToolPolicyConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Provider discovery & health-loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Master switch. The `ANT_DISABLE_PROVIDER_DISCOVERY` kill-switch
    /// and `NODE_ENV=test` override this to off.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overlay file path. Relative paths resolve against the Ant home.
    #[serde(default = "default_overlay_path")]
    pub overlay_path: PathBuf,
    /// Candidate provider configs probed in `scheduled` mode. Keys are
    /// provider ids; discovery never invents candidates.
    #[serde(default)]
    pub candidates: HashMap<String, ProviderEntry>,
    /// Additional candidates probed only in `emergency` mode (known
    /// local endpoints and the like).
    #[serde(default)]
    pub emergency_candidates: HashMap<String, ProviderEntry>,
    /// Records at or above this many consecutive failures are dropped.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Per-probe timeout.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_overlay_path() -> PathBuf {
    PathBuf::from("providers.json")
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    8_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overlay_path: default_overlay_path(),
            candidates: HashMap::new(),
            emergency_candidates: HashMap::new(),
            max_consecutive_failures: default_max_consecutive_failures(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor (MainAgent)
// ---------------------------------------------------------------------------

/// Which owner notifications are emitted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyOptions {
    /// Provider survival/recovery and removal alerts.
    #[serde(default = "default_true")]
    pub providers: bool,
    /// Error-scan investigation starts.
    #[serde(default = "default_true")]
    pub errors: bool,
    /// Outcome of incident-tagged tasks.
    #[serde(default = "default_true")]
    pub incident_results: bool,
    /// Owner-update payloads extracted from duty responses.
    #[serde(default = "default_true")]
    pub improvements: bool,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            providers: true,
            errors: true,
            incident_results: true,
            improvements: true,
        }
    }
}

/// MainAgent supervisor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Duty-cycle interval.
    #[serde(default = "default_cycle_interval_ms")]
    pub interval_ms: u64,
    /// Error-scan loop interval (clamped to >= 1 s).
    #[serde(default = "default_error_scan_interval_ms")]
    pub error_scan_interval_ms: u64,
    /// Suppression window for repeated error signatures.
    #[serde(default = "default_investigation_cooldown_ms")]
    pub investigation_cooldown_ms: i64,
    /// Minimum gap between scheduled overlay health passes.
    #[serde(default = "default_health_check_interval_minutes")]
    pub health_check_interval_minutes: i64,
    /// Minimum gap between scheduled discovery passes.
    #[serde(default = "default_research_interval_hours")]
    pub research_interval_hours: i64,
    /// Warn when fewer discovered providers than this remain.
    #[serde(default = "default_min_backup_providers")]
    pub min_backup_providers: usize,
    /// Minimum gap between emergency discovery attempts while in
    /// survival mode.
    #[serde(default = "default_survival_cooldown_ms")]
    pub survival_attempt_cooldown_ms: i64,
    /// Owner recipients for notifications.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Extra recipients for the startup notification.
    #[serde(default)]
    pub startup_recipients: Vec<String>,
    /// Notification gates.
    #[serde(default)]
    pub notify_on: NotifyOptions,
    /// Structured log file scanned for errors. Relative paths resolve
    /// against the Ant home.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_cycle_interval_ms() -> u64 {
    60_000
}

fn default_error_scan_interval_ms() -> u64 {
    30_000
}

fn default_investigation_cooldown_ms() -> i64 {
    15 * 60 * 1_000
}

fn default_health_check_interval_minutes() -> i64 {
    30
}

fn default_research_interval_hours() -> i64 {
    24
}

fn default_min_backup_providers() -> usize {
    2
}

fn default_survival_cooldown_ms() -> i64 {
    5 * 60 * 1_000
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/antd.jsonl")
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_cycle_interval_ms(),
            error_scan_interval_ms: default_error_scan_interval_ms(),
            investigation_cooldown_ms: default_investigation_cooldown_ms(),
            health_check_interval_minutes: default_health_check_interval_minutes(),
            research_interval_hours: default_research_interval_hours(),
            min_backup_providers: default_min_backup_providers(),
            survival_attempt_cooldown_ms: default_survival_cooldown_ms(),
            owners: Vec::new(),
            startup_recipients: Vec::new(),
            notify_on: NotifyOptions::default(),
            log_path: default_log_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message router
// ---------------------------------------------------------------------------

/// Cross-channel message router settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Per-queue length cap; excess messages are dropped with a notice.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Queue-age and processing deadline for one dispatch.
    #[serde(default = "default_session_queue_timeout_ms")]
    pub session_queue_timeout_ms: i64,
    /// Bound on simultaneously busy sessions.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Strict per-session serial dispatch (default) vs channel-scoped
    /// queues.
    #[serde(default = "default_true")]
    pub session_ordering_enabled: bool,
    /// Per-channel concurrency when session ordering is disabled.
    #[serde(default = "default_channel_concurrency")]
    pub channel_concurrency: usize,
    /// Sessions idle longer than this are pruned.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: i64,
    /// Hard cap on live sessions; LRU-evicted beyond this.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_queue_size() -> usize {
    50
}

fn default_session_queue_timeout_ms() -> i64 {
    120_000
}

fn default_max_concurrent_sessions() -> usize {
    10
}

fn default_channel_concurrency() -> usize {
    4
}

fn default_session_timeout_ms() -> i64 {
    60 * 60 * 1_000
}

fn default_max_sessions() -> usize {
    1_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            session_queue_timeout_ms: default_session_queue_timeout_ms(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            session_ordering_enabled: true,
            channel_concurrency: default_channel_concurrency(),
            session_timeout_ms: default_session_timeout_ms(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Provider definitions keyed by id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Routing table and fallback chain.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Circuit-breaker cooldowns.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Health probe/cache settings.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Task engine settings.
    #[serde(default)]
    pub tasks: TasksConfig,
    /// Agent engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// MainAgent supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Message router settings.
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Config = serde_yaml_ng::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Resolve a configured path against the Ant home directory.
    pub fn resolve_path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            crate::ant_home().join(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.breaker.base_ms, 2_000);
        assert_eq!(cfg.breaker.cap_ms, 300_000);
        assert_eq!(cfg.tasks.main_concurrency, 1);
        assert_eq!(cfg.tasks.autonomous_concurrency, 5);
        assert_eq!(cfg.tasks.maintenance_concurrency, 1);
        assert_eq!(cfg.router.max_sessions, 1_000);
        assert!(cfg.router.session_ordering_enabled);
        assert_eq!(cfg.supervisor.interval_ms, 60_000);
        assert_eq!(cfg.supervisor.error_scan_interval_ms, 30_000);
    }

    #[test]
    fn parse_provider_entry() {
        let yaml = r#"
providers:
  lmstudio:
    type: openai
    base_url: http://127.0.0.1:1234/v1
    model: qwen2.5
    models:
      summary: qwen2.5-small
  runner:
    type: cli
    cli_provider: codex
    model: o4-mini
    args: ["exec", "-"]
routing:
  actions:
    chat: lmstudio
  fallback_chain: [lmstudio, runner]
"#;
        let cfg: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(cfg.providers.len(), 2);
        let lm = &cfg.providers["lmstudio"];
        assert_eq!(lm.kind, ProviderKind::Openai);
        assert_eq!(lm.models.summary.as_deref(), Some("qwen2.5-small"));
        let cli = &cfg.providers["runner"];
        assert_eq!(cli.kind, ProviderKind::Cli);
        assert_eq!(cli.cli_provider.as_deref(), Some("codex"));
        assert_eq!(cfg.routing.actions["chat"], "lmstudio");
        assert_eq!(cfg.routing.fallback_chain, vec!["lmstudio", "runner"]);
    }

    #[test]
    fn notify_options_default_on() {
        let n = NotifyOptions::default();
        assert!(n.providers && n.errors && n.incident_results && n.improvements);
    }
}
