//! Task records, lanes, and the execution engine.
//!
//! Submodules: [`store`] (crash-safe persistence), [`queue`]
//! (lane-partitioned execution with retries), [`monitor`] (timeout
//! scanning), and [`phases`] (ordered subagent phases).

pub mod monitor;
pub mod phases;
pub mod queue;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::config::TasksConfig;

pub use monitor::TimeoutMonitor;
pub use phases::{Phase, PhaseContext, PhaseExecutor};
pub use queue::TaskQueue;
pub use store::TaskStore;

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// Named partition of the task queue with its own concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Main,
    Autonomous,
    Maintenance,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Main => "main",
            Lane::Autonomous => "autonomous",
            Lane::Maintenance => "maintenance",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Task lifecycle status.
///
/// Transitions follow `created → queued → running ↔ retrying →
/// {succeeded, failed}`; `retrying → queued` is the only
/// progress-decreasing edge and always carries an increased attempt
/// count. Restart replay additionally re-queues tasks found `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Whether `self → next` is a regular lifecycle edge.
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Running)
                | (Running, Retrying)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Retrying, Queued)
                | (Retrying, Running)
                | (Retrying, Failed)
                // Restart replay re-queues interrupted work.
                | (Running, Queued)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// Retry bookkeeping carried on every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    /// Runs attempted so far. Never exceeds `max_attempts`.
    pub attempted: u32,
    pub max_attempts: u32,
    /// When the next retry becomes eligible (epoch ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    /// Attempt-1 backoff for this task. Never rewritten; each retry's
    /// delay is derived from this value and the attempt number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<i64>,
    /// Backoff applied to the most recently scheduled retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<i64>,
}

/// Free-form routing metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A unit of work tracked by the engine. Serialised 1:1 to
/// `<id>.json` in the task directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Parent task for subagent work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub description: String,
    pub session_key: String,
    pub lane: Lane,
    pub status: TaskStatus,
    pub retries: RetryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// Session the subagent phases run under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_session_key: Option<String>,
}

impl Task {
    /// Fresh task in `created` status with a v4 UUID.
    pub fn new(description: impl Into<String>, session_key: impl Into<String>, lane: Lane) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            description: description.into(),
            session_key: session_key.into(),
            lane,
            status: TaskStatus::Created,
            retries: RetryState {
                attempted: 0,
                max_attempts: 3,
                next_retry_at: None,
                base_backoff_ms: None,
                backoff_ms: None,
            },
            timeout_ms: None,
            created_at: crate::utils::now_ms(),
            started_at: None,
            ended_at: None,
            error: None,
            result: None,
            metadata: TaskMetadata::default(),
            subagent_session_key: None,
        }
    }

    /// Apply configured defaults for timeout, attempt budget, and
    /// retry base. Call right after [`Task::new`], before per-task
    /// overrides.
    pub fn with_defaults(mut self, cfg: &TasksConfig) -> Self {
        self.timeout_ms = Some(cfg.default_timeout_ms);
        self.retries.max_attempts = cfg.default_max_attempts.max(1);
        self.retries.base_backoff_ms = Some(cfg.retry_backoff_ms);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retries.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_backoff_ms(mut self, base_backoff_ms: i64) -> Self {
        self.retries.base_backoff_ms = Some(base_backoff_ms);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }
}
