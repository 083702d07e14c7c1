//! MainAgent supervisor: duty cycle, survival mode, error scanning,
//! incident tasks, and restart recovery.
//!
//! The duty cycle keeps the provider pool alive (emergency discovery
//! when nothing is healthy, scheduled health/discovery passes
//! otherwise) and runs one autonomous duty turn when the task queue is
//! idle. An independent scan loop tails the structured log for novel
//! error signatures and turns them into Maintenance-lane incident
//! tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::discovery::{DiscoveryMode, ProviderDiscoveryService};
use crate::engine::{AgentEngine, EngineRequest};
use crate::events::{MonitorBus, MonitorEvent};
use crate::manager::ProviderManager;
use crate::tasks::queue::TaskJob;
use crate::tasks::{Lane, Task, TaskQueue, TaskStatus, TaskStore};

/// Bytes of log tail examined per error scan.
const LOG_TAIL_BYTES: u64 = 256 * 1024;

/// Log level at or above which events become incident candidates.
const ERROR_LEVEL_THRESHOLD: i64 = crate::logs::ERROR_LEVEL;

/// New investigations allowed per scan pass.
const MAX_INVESTIGATIONS_PER_SCAN: usize = 2;

/// Error events examined per scan pass.
const MAX_EVENTS_PER_SCAN: usize = 5;

/// Session key scoping autonomous duty turns.
const DUTY_SESSION_KEY: &str = "main:agent:duty";

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Pluggable owner notification sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_message(&self, recipient: &str, text: &str) -> anyhow::Result<()>;
}

/// Sink delivering through the message router's outbound path.
pub struct RouterNotificationSink(pub Arc<crate::router::MessageRouter>);

#[async_trait]
impl NotificationSink for RouterNotificationSink {
    async fn send_message(&self, recipient: &str, text: &str) -> anyhow::Result<()> {
        self.0.send_to_session(recipient, text, Vec::new()).await
    }
}

/// Notification category, gated by `notify_on` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Providers,
    Errors,
    IncidentResults,
    Improvements,
}

// ---------------------------------------------------------------------------
// Log scanning
// ---------------------------------------------------------------------------

/// One structured log event relevant to the error scanner.
#[derive(Debug, Clone)]
pub struct LogErrorEvent {
    pub time: i64,
    pub level: i64,
    pub msg: String,
    pub error: Option<String>,
    pub provider_id: Option<String>,
    pub model: Option<String>,
}

impl LogErrorEvent {
    /// Stable signature for dedupe: SHA-256 of `summary\ndetails`.
    pub fn signature(&self) -> String {
        let payload = format!("{}\n{}", self.msg, self.error.as_deref().unwrap_or(""));
        let digest = ring::digest::digest(&ring::digest::SHA256, payload.as_bytes());
        digest
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Parse one JSON log line into an event. Tolerates both `time` and
/// `timestamp` field names and nested `err.message`.
pub fn parse_log_line(line: &str) -> Option<LogErrorEvent> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let time = value["time"]
        .as_i64()
        .or_else(|| value["timestamp"].as_i64())?;
    let level = value["level"].as_i64()?;
    let msg = value["msg"].as_str().unwrap_or("").to_string();
    let error = value["error"]
        .as_str()
        .map(String::from)
        .or_else(|| value["err"]["message"].as_str().map(String::from));
    Some(LogErrorEvent {
        time,
        level,
        msg,
        error,
        provider_id: value["providerId"]
            .as_str()
            .or_else(|| value["provider_id"].as_str())
            .map(String::from),
        model: value["model"].as_str().map(String::from),
    })
}

// ---------------------------------------------------------------------------
// MainAgent
// ---------------------------------------------------------------------------

/// Builds the re-runnable job for a task (restart replay, incident
/// investigations). The default factory runs the task description as
/// an agent turn.
pub type JobFactory = Arc<dyn Fn(&Task) -> TaskJob + Send + Sync>;

struct SupervisorState {
    running: bool,
    paused: bool,
    survival_mode: bool,
    last_survival_attempt_at: i64,
    last_health_check_at: i64,
    last_discovery_at: i64,
    last_error_scan_at: i64,
    scan_in_flight: bool,
    /// signature → last investigation start (epoch ms).
    recent_signatures: HashMap<String, i64>,
}

/// The self-driving supervisor.
pub struct MainAgent {
    cfg: SupervisorConfig,
    manager: Arc<ProviderManager>,
    engine: Arc<AgentEngine>,
    discovery: Arc<ProviderDiscoveryService>,
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    bus: MonitorBus,
    sink: Arc<dyn NotificationSink>,
    job_factory: std::sync::RwLock<JobFactory>,
    log_path: PathBuf,
    state: Mutex<SupervisorState>,
}

impl MainAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SupervisorConfig,
        manager: Arc<ProviderManager>,
        engine: Arc<AgentEngine>,
        discovery: Arc<ProviderDiscoveryService>,
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        bus: MonitorBus,
        sink: Arc<dyn NotificationSink>,
        log_path: PathBuf,
    ) -> Arc<Self> {
        let engine_for_jobs = engine.clone();
        let default_factory: JobFactory = Arc::new(move |task: &Task| {
            let engine = engine_for_jobs.clone();
            let session_key = task
                .subagent_session_key
                .clone()
                .unwrap_or_else(|| task.session_key.clone());
            let query = task.description.clone();
            let channel = task
                .metadata
                .channel
                .clone()
                .unwrap_or_else(|| "system".into());
            Arc::new(move || {
                let engine = engine.clone();
                let session_key = session_key.clone();
                let query = query.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    let resp = engine
                        .execute(EngineRequest {
                            session_key,
                            query,
                            channel,
                            chat_id: None,
                            audience: None,
                        })
                        .await?;
                    Ok(serde_json::json!({
                        "response": resp.response,
                        "providerId": resp.provider_id,
                        "model": resp.model,
                    }))
                })
            })
        });

        Arc::new(Self {
            cfg,
            manager,
            engine,
            discovery,
            store,
            queue,
            bus,
            sink,
            job_factory: std::sync::RwLock::new(default_factory),
            log_path,
            state: Mutex::new(SupervisorState {
                running: false,
                paused: false,
                survival_mode: false,
                last_survival_attempt_at: 0,
                last_health_check_at: 0,
                last_discovery_at: 0,
                last_error_scan_at: crate::utils::now_ms(),
                scan_in_flight: false,
                recent_signatures: HashMap::new(),
            }),
        })
    }

    /// Replace the job factory used for replayed and incident tasks.
    pub fn set_job_factory(&self, factory: JobFactory) {
        if let Ok(mut slot) = self.job_factory.write() {
            *slot = factory;
        }
    }

    fn make_job(&self, task: &Task) -> TaskJob {
        let factory = self
            .job_factory
            .read()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        factory(task)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start all supervisor loops and replay persisted work.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        {
            let mut state = self.state.lock().await;
            state.running = true;
        }

        self.replay_active_tasks().await;
        self.notify(
            NotifyKind::Providers,
            "Main agent online.",
            true,
        )
        .await;

        // Duty cycle.
        {
            let agent = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(agent.cfg.interval_ms.max(1_000)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => agent.run_cycle().await,
                    }
                }
            });
        }

        // Error scan loop.
        {
            let agent = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let every =
                    Duration::from_millis(agent.cfg.error_scan_interval_ms.max(1_000));
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = agent.scan_errors().await {
                                warn!(error = %e, "error scan failed");
                            }
                        }
                    }
                }
            });
        }

        // Incident outcome watcher.
        {
            let agent = self.clone();
            let mut rx = self.bus.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Ok(event) => agent.on_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                }
            });
        }
    }

    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
    }

    // -- restart recovery ---------------------------------------------------

    /// Re-enqueue every non-terminal persisted task, preserving any
    /// pending retry delay.
    pub async fn replay_active_tasks(&self) {
        let active = match self.store.active_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "restart replay: store scan failed");
                return;
            }
        };
        if active.is_empty() {
            return;
        }
        info!(count = active.len(), "replaying persisted tasks");

        let now = crate::utils::now_ms();
        for task in active {
            if let Err(e) = self
                .store
                .update_status(&task.id, TaskStatus::Queued, Some("resume_after_restart"))
                .await
            {
                warn!(task_id = %task.id, error = %e, "replay: status update failed");
                continue;
            }
            let job = self.make_job(&task);
            let delay = task
                .retries
                .next_retry_at
                .map(|at| (at - now).max(0))
                .unwrap_or(0);
            if delay > 0 {
                self.queue.enqueue_with_delay(
                    &task.id,
                    task.lane,
                    job,
                    Duration::from_millis(delay as u64),
                );
            } else {
                self.queue.enqueue(&task.id, task.lane, job).await;
            }
        }
    }

    // -- duty cycle ---------------------------------------------------------

    /// One supervisor cycle: provider maintenance, scheduled passes,
    /// autonomous duty.
    pub async fn run_cycle(&self) {
        {
            let state = self.state.lock().await;
            if !state.running || state.paused {
                return;
            }
        }

        self.provider_maintenance().await;

        let survival = self.state.lock().await.survival_mode;
        if !survival && !self.discovery.is_disabled() {
            self.scheduled_passes().await;
        }

        let idle = self
            .store
            .active_tasks()
            .await
            .map(|tasks| tasks.is_empty())
            .unwrap_or(false);
        if idle {
            self.run_duty().await;
        }
    }

    /// Survival-mode bookkeeping around `has_healthy_provider`.
    async fn provider_maintenance(&self) {
        let healthy = self.manager.has_healthy_provider().await;
        let now = crate::utils::now_ms();

        if !healthy {
            let newly_survival = {
                let mut state = self.state.lock().await;
                if state.survival_mode {
                    false
                } else {
                    state.survival_mode = true;
                    true
                }
            };
            if newly_survival {
                warn!("no healthy provider, entering survival mode");
                self.notify(
                    NotifyKind::Providers,
                    "No healthy language-model provider remains; entering survival mode.",
                    false,
                )
                .await;
            }
            let attempt_due = {
                let state = self.state.lock().await;
                now - state.last_survival_attempt_at >= self.cfg.survival_attempt_cooldown_ms
            };

            if attempt_due {
                self.state.lock().await.last_survival_attempt_at = now;
                match self.discovery.run_discovery(DiscoveryMode::Emergency).await {
                    Ok(outcome) if outcome.ok => {
                        debug!(added = outcome.added.len(), "emergency discovery finished")
                    }
                    Ok(outcome) => debug!(error = ?outcome.error, "emergency discovery skipped"),
                    Err(e) => warn!(error = %e, "emergency discovery failed"),
                }
            }

            if self.manager.has_healthy_provider().await {
                self.state.lock().await.survival_mode = false;
                info!("provider pool recovered");
                self.notify(
                    NotifyKind::Providers,
                    "Provider pool recovered; leaving survival mode.",
                    false,
                )
                .await;
            }
        } else {
            let was_survival = {
                let mut state = self.state.lock().await;
                let was = state.survival_mode;
                state.survival_mode = false;
                was
            };
            if was_survival {
                info!("provider pool recovered");
                self.notify(
                    NotifyKind::Providers,
                    "Provider pool recovered; leaving survival mode.",
                    false,
                )
                .await;
            }
        }
    }

    /// Scheduled overlay health check and discovery passes.
    async fn scheduled_passes(&self) {
        let now = crate::utils::now_ms();
        let (health_due, discovery_due) = {
            let state = self.state.lock().await;
            (
                now - state.last_health_check_at
                    >= self.cfg.health_check_interval_minutes * 60 * 1_000,
                now - state.last_discovery_at
                    >= self.cfg.research_interval_hours * 60 * 60 * 1_000,
            )
        };

        if health_due {
            self.state.lock().await.last_health_check_at = now;
            match self.discovery.run_health_check().await {
                Ok(outcome) if outcome.ok && !outcome.removed.is_empty() => {
                    self.notify(
                        NotifyKind::Providers,
                        &format!(
                            "Removed unhealthy discovered providers: {}",
                            outcome.removed.join(", ")
                        ),
                        false,
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "scheduled health check failed"),
            }
        }

        if discovery_due {
            self.state.lock().await.last_discovery_at = now;
            match self.discovery.run_discovery(DiscoveryMode::Scheduled).await {
                Ok(outcome) if outcome.ok => {
                    if !outcome.added.is_empty() || !outcome.removed.is_empty() {
                        self.notify(
                            NotifyKind::Providers,
                            &format!(
                                "Provider discovery: {} added, {} removed, {} total.",
                                outcome.added.len(),
                                outcome.removed.len(),
                                outcome.total
                            ),
                            false,
                        )
                        .await;
                    }
                    if outcome.total < self.cfg.min_backup_providers {
                        warn!(
                            total = outcome.total,
                            minimum = self.cfg.min_backup_providers,
                            "backup provider pool below minimum"
                        );
                        self.notify(
                            NotifyKind::Providers,
                            &format!(
                                "Only {} backup providers discovered (minimum {}).",
                                outcome.total, self.cfg.min_backup_providers
                            ),
                            false,
                        )
                        .await;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "scheduled discovery failed"),
            }
        }
    }

    /// One autonomous duty turn through the engine.
    async fn run_duty(&self) {
        let request = EngineRequest {
            session_key: DUTY_SESSION_KEY.into(),
            query: "Review system state and perform any pending maintenance duties. \
                    If owners should hear about something, start a line with OWNER UPDATE:."
                .into(),
            channel: "system".into(),
            chat_id: None,
            audience: None,
        };
        match self.engine.execute(request).await {
            Ok(resp) => {
                debug!(provider_id = %resp.provider_id, "duty turn complete");
                for line in resp.response.lines() {
                    if let Some(update) = line.trim().strip_prefix("OWNER UPDATE:") {
                        self.notify(NotifyKind::Improvements, update.trim(), false)
                            .await;
                    }
                }
            }
            Err(e) => debug!(error = %e, "duty turn skipped"),
        }
    }

    // -- error scanning -----------------------------------------------------

    /// One scan pass over the structured log tail. Serialized by an
    /// in-flight flag; caps investigations and events per pass.
    pub async fn scan_errors(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.running || state.paused || state.scan_in_flight {
                return Ok(());
            }
            state.scan_in_flight = true;
        }
        let result = self.scan_errors_inner().await;
        self.state.lock().await.scan_in_flight = false;
        result
    }

    async fn scan_errors_inner(&self) -> anyhow::Result<()> {
        let since = self.state.lock().await.last_error_scan_at;
        let now = crate::utils::now_ms();

        let tail = match read_log_tail(&self.log_path, LOG_TAIL_BYTES).await {
            Ok(tail) => tail,
            Err(e) => {
                debug!(error = %e, "log tail unavailable");
                self.state.lock().await.last_error_scan_at = now;
                return Ok(());
            }
        };

        let events: Vec<LogErrorEvent> = tail
            .lines()
            .filter_map(parse_log_line)
            .filter(|e| e.level >= ERROR_LEVEL_THRESHOLD && e.time > since)
            .take(MAX_EVENTS_PER_SCAN)
            .collect();

        let mut investigations = 0usize;
        for event in events {
            if investigations >= MAX_INVESTIGATIONS_PER_SCAN {
                break;
            }
            let signature = event.signature();
            let fresh = {
                let mut state = self.state.lock().await;
                match state.recent_signatures.get(&signature) {
                    Some(last) if now - last < self.cfg.investigation_cooldown_ms => false,
                    _ => {
                        state.recent_signatures.insert(signature.clone(), now);
                        true
                    }
                }
            };
            if !fresh {
                continue;
            }

            investigations += 1;
            if let Err(e) = self.spawn_investigation(&event).await {
                warn!(error = %e, "incident task creation failed");
            }
        }

        self.state.lock().await.last_error_scan_at = now;
        Ok(())
    }

    /// Create and enqueue a Maintenance-lane investigation task for a
    /// novel error signature.
    async fn spawn_investigation(&self, event: &LogErrorEvent) -> anyhow::Result<()> {
        let mut description = format!(
            "Investigate recurring error: {}",
            crate::utils::truncate_str(&event.msg, 300)
        );
        if let Some(ref error) = event.error {
            description.push_str(&format!(
                "\nDetails: {}",
                crate::utils::truncate_str(error, 500)
            ));
        }
        if let Some(ref provider_id) = event.provider_id {
            description.push_str(&format!("\nProvider: {provider_id}"));
        }
        if let Some(ref model) = event.model {
            description.push_str(&format!("\nModel: {model}"));
        }

        let task = self
            .queue
            .build_task(description, DUTY_SESSION_KEY, Lane::Maintenance)
            .with_tags(vec!["incident".into(), "investigation".into()]);
        let task = self.store.create(task).await?;
        self.bus.emit(MonitorEvent::TaskCreated {
            task_id: task.id.clone(),
        });

        info!(task_id = %task.id, "incident investigation queued");
        let job = self.make_job(&task);
        self.queue.enqueue(&task.id, Lane::Maintenance, job).await;

        self.notify(
            NotifyKind::Errors,
            &format!(
                "Investigating error: {}",
                crate::utils::truncate_str(&event.msg, 200)
            ),
            false,
        )
        .await;
        Ok(())
    }

    // -- incident outcomes --------------------------------------------------

    async fn on_event(&self, event: MonitorEvent) {
        let (task_id, outcome) = match &event {
            MonitorEvent::TaskSucceeded { task_id, .. } => (task_id.clone(), "succeeded"),
            MonitorEvent::TaskFailed { task_id, .. } => (task_id.clone(), "failed"),
            _ => return,
        };
        let Ok(Some(task)) = self.store.get(&task_id).await else {
            return;
        };
        if !task.has_tag("incident") {
            return;
        }
        let summary = match outcome {
            "succeeded" => task
                .result
                .as_ref()
                .and_then(|r| r["response"].as_str())
                .map(|s| crate::utils::truncate_str(s, 400))
                .unwrap_or_else(|| "investigation finished".into()),
            _ => task
                .error
                .clone()
                .unwrap_or_else(|| "investigation failed".into()),
        };
        self.notify(
            NotifyKind::IncidentResults,
            &format!("Incident task {outcome}: {summary}"),
            false,
        )
        .await;
    }

    // -- notifications ------------------------------------------------------

    /// Deliver `text` to the owner recipients, honoring the
    /// per-category gate unless `force` is set.
    pub async fn notify(&self, kind: NotifyKind, text: &str, force: bool) {
        let allowed = match kind {
            NotifyKind::Providers => self.cfg.notify_on.providers,
            NotifyKind::Errors => self.cfg.notify_on.errors,
            NotifyKind::IncidentResults => self.cfg.notify_on.incident_results,
            NotifyKind::Improvements => self.cfg.notify_on.improvements,
        };
        if !allowed && !force {
            return;
        }

        let mut recipients: Vec<&String> = self
            .cfg
            .owners
            .iter()
            .chain(self.cfg.startup_recipients.iter())
            .collect();
        recipients.sort();
        recipients.dedup();

        for recipient in recipients {
            if let Err(e) = self.sink.send_message(recipient, text).await {
                debug!(recipient = %recipient, error = %e, "owner notification undeliverable");
            }
        }
    }
}

/// Read at most `max_bytes` from the end of the log file.
async fn read_log_tail(path: &std::path::Path, max_bytes: u64) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf).into_owned();
    // A mid-line start position leaves a partial first line; drop it.
    if start > 0 {
        Ok(text
            .split_once('\n')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default())
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BreakerConfig, DiscoveryConfig, EngineConfig, HealthCheckConfig, TasksConfig,
    };
    use crate::engine::{StaticPromptBuilder, ToolRegistry};
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        messages: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send_message(&self, recipient: &str, text: &str) -> anyhow::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        agent: Arc<MainAgent>,
        sink: Arc<RecordingSink>,
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        log_path: PathBuf,
    }

    async fn fixture(cfg: SupervisorConfig) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = Arc::new(ProviderManager::new(
            BreakerConfig::default(),
            HealthCheckConfig::default(),
        ));
        let store = Arc::new(TaskStore::open(&dir.path().join("tasks"), 0).await.unwrap());
        let bus = MonitorBus::new();
        let queue = TaskQueue::new(store.clone(), bus.clone(), TasksConfig::default());
        let engine = Arc::new(AgentEngine::new(
            manager.clone(),
            ToolRegistry::new(),
            EngineConfig::default(),
            &dir.path().join("sessions"),
            Arc::new(StaticPromptBuilder("test".into())),
        ));
        let discovery = Arc::new(ProviderDiscoveryService::new(
            DiscoveryConfig::default(),
            dir.path().join("providers.json"),
            manager.clone(),
            Vec::new(),
        ));
        let sink = Arc::new(RecordingSink {
            messages: StdMutex::new(Vec::new()),
        });
        let log_path = dir.path().join("antd.jsonl");

        let agent = MainAgent::new(
            cfg,
            manager,
            engine,
            discovery,
            store.clone(),
            queue.clone(),
            bus,
            sink.clone(),
            log_path.clone(),
        );
        agent.state.lock().await.running = true;
        Fixture {
            _dir: dir,
            agent,
            sink,
            store,
            queue,
            log_path,
        }
    }

    fn owners_cfg() -> SupervisorConfig {
        SupervisorConfig {
            owners: vec!["telegram:dm:owner".into()],
            ..SupervisorConfig::default()
        }
    }

    fn log_line(time: i64, level: i64, msg: &str, error: Option<&str>) -> String {
        let mut v = serde_json::json!({"time": time, "level": level, "msg": msg});
        if let Some(error) = error {
            v["error"] = serde_json::json!(error);
        }
        serde_json::to_string(&v).unwrap()
    }

    #[test]
    fn parse_log_line_variants() {
        let ev = parse_log_line(r#"{"time": 10, "level": 50, "msg": "boom", "error": "details"}"#)
            .unwrap();
        assert_eq!(ev.time, 10);
        assert_eq!(ev.error.as_deref(), Some("details"));

        let ev = parse_log_line(
            r#"{"timestamp": 11, "level": 50, "msg": "x", "err": {"message": "nested"}, "providerId": "p"}"#,
        )
        .unwrap();
        assert_eq!(ev.time, 11);
        assert_eq!(ev.error.as_deref(), Some("nested"));
        assert_eq!(ev.provider_id.as_deref(), Some("p"));

        assert!(parse_log_line("not json").is_none());
        assert!(parse_log_line(r#"{"level": 50, "msg": "no time"}"#).is_none());
    }

    #[test]
    fn signatures_differ_by_summary_and_details() {
        let base = LogErrorEvent {
            time: 1,
            level: 50,
            msg: "a".into(),
            error: Some("b".into()),
            provider_id: None,
            model: None,
        };
        let mut other = base.clone();
        other.error = Some("c".into());
        assert_ne!(base.signature(), other.signature());
        assert_eq!(base.signature().len(), 64);
    }

    #[tokio::test]
    async fn scan_creates_capped_incident_tasks() {
        let f = fixture(owners_cfg()).await;
        let now = crate::utils::now_ms();
        f.agent.state.lock().await.last_error_scan_at = now - 60_000;

        // Three distinct errors newer than the watermark: cap is 2
        // investigations per pass.
        let lines: Vec<String> = (0..3)
            .map(|i| log_line(now - 1_000 + i, 50, &format!("failure {i}"), Some("stack")))
            .collect();
        tokio::fs::write(&f.log_path, lines.join("\n")).await.unwrap();

        f.agent.scan_errors().await.unwrap();

        let tasks = f.store.list().await.unwrap();
        let incidents: Vec<&Task> = tasks.iter().filter(|t| t.has_tag("incident")).collect();
        assert_eq!(incidents.len(), 2);
        assert!(incidents.iter().all(|t| t.lane == Lane::Maintenance));
        assert!(incidents.iter().all(|t| t.has_tag("investigation")));
        // Incident tasks pick up the configured queue defaults.
        let defaults = TasksConfig::default();
        assert!(incidents
            .iter()
            .all(|t| t.timeout_ms == Some(defaults.default_timeout_ms)
                && t.retries.max_attempts == defaults.default_max_attempts));

        let notices = f.sink.messages.lock().unwrap();
        assert_eq!(
            notices
                .iter()
                .filter(|(_, text)| text.starts_with("Investigating error"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn scan_dedupes_repeated_signatures() {
        let f = fixture(owners_cfg()).await;
        let now = crate::utils::now_ms();
        f.agent.state.lock().await.last_error_scan_at = now - 60_000;

        let line = log_line(now - 500, 50, "same failure", Some("same stack"));
        tokio::fs::write(&f.log_path, &line).await.unwrap();
        f.agent.scan_errors().await.unwrap();

        // Same signature again, newer timestamp, inside the cooldown.
        f.agent.state.lock().await.last_error_scan_at = now - 60_000;
        let line2 = log_line(now - 100, 50, "same failure", Some("same stack"));
        tokio::fs::write(&f.log_path, format!("{line}\n{line2}"))
            .await
            .unwrap();
        f.agent.scan_errors().await.unwrap();

        let tasks = f.store.list().await.unwrap();
        assert_eq!(tasks.iter().filter(|t| t.has_tag("incident")).count(), 1);
    }

    #[tokio::test]
    async fn scan_ignores_low_levels_and_old_events() {
        let f = fixture(owners_cfg()).await;
        let now = crate::utils::now_ms();
        f.agent.state.lock().await.last_error_scan_at = now - 10_000;

        let lines = [
            log_line(now - 1_000, 40, "warn only", None),
            log_line(now - 20_000, 50, "too old", None),
        ];
        tokio::fs::write(&f.log_path, lines.join("\n")).await.unwrap();
        f.agent.scan_errors().await.unwrap();

        assert!(f.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_requeues_non_terminal_tasks() {
        let f = fixture(owners_cfg()).await;

        let interrupted = f
            .store
            .create(Task::new("interrupted work", "s", Lane::Autonomous))
            .await
            .unwrap();
        f.store
            .update(&interrupted.id, |t| {
                t.status = TaskStatus::Running;
                t.started_at = Some(crate::utils::now_ms());
            })
            .await
            .unwrap();

        f.agent.replay_active_tasks().await;

        // The job factory runs the description through the engine;
        // with no providers it fails after its attempts, but the task
        // must have been re-queued with the restart note first.
        let task = f.store.get(&interrupted.id).await.unwrap().unwrap();
        assert!(matches!(
            task.status,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Retrying | TaskStatus::Failed
        ));
        let reached_terminal = f
            .queue
            .wait_for_completion(&interrupted.id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reached_terminal.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn survival_mode_notifies_once_until_recovery() {
        let f = fixture(owners_cfg()).await;
        // No providers registered: never healthy.
        f.agent.provider_maintenance().await;
        f.agent.provider_maintenance().await;

        let notices = f.sink.messages.lock().unwrap();
        let survival: Vec<&(String, String)> = notices
            .iter()
            .filter(|(_, text)| text.contains("survival mode"))
            .collect();
        assert_eq!(survival.len(), 1);
        assert_eq!(survival[0].0, "telegram:dm:owner");
    }

    #[tokio::test]
    async fn notify_honors_gates_and_force() {
        let mut cfg = owners_cfg();
        cfg.notify_on.errors = false;
        let f = fixture(cfg).await;

        f.agent.notify(NotifyKind::Errors, "suppressed", false).await;
        f.agent.notify(NotifyKind::Errors, "forced", true).await;

        let notices = f.sink.messages.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].1, "forced");
    }

    #[tokio::test]
    async fn incident_outcome_notifies_owner() {
        let f = fixture(owners_cfg()).await;
        let task = f
            .store
            .create(
                Task::new("inv", "s", Lane::Maintenance)
                    .with_tags(vec!["incident".into()]),
            )
            .await
            .unwrap();
        f.store
            .update_status(&task.id, TaskStatus::Failed, Some("probe exploded"))
            .await
            .unwrap();

        f.agent
            .on_event(MonitorEvent::TaskFailed {
                task_id: task.id.clone(),
                error: "probe exploded".into(),
            })
            .await;

        let notices = f.sink.messages.lock().unwrap();
        assert!(notices
            .iter()
            .any(|(_, text)| text.contains("Incident task failed") && text.contains("probe exploded")));
    }

    #[tokio::test]
    async fn tail_read_is_bounded_and_line_aligned() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.jsonl");
        let mut content = String::new();
        for i in 0..20_000 {
            content.push_str(&log_line(i, 30, &format!("line {i}"), None));
            content.push('\n');
        }
        tokio::fs::write(&path, &content).await.unwrap();

        let tail = read_log_tail(&path, LOG_TAIL_BYTES).await.unwrap();
        assert!(tail.len() as u64 <= LOG_TAIL_BYTES);
        // Every surviving line parses: no partial first line.
        assert!(tail.lines().all(|l| parse_log_line(l).is_some()));
    }
}
