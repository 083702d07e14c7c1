//! Monitor bus: tagged lifecycle events over a broadcast channel.
//!
//! Every component publishes [`MonitorEvent`]s through an explicit
//! [`MonitorBus`] handle passed at construction; nothing reaches for a
//! global. Subscribers receive every event sent after subscription and
//! filter by [`MonitorEvent::kind`]. Delivery is at-least-once within
//! the process and best-effort across restarts.

use tokio::sync::broadcast;

/// Capacity of the in-process event channel.
const CHANNEL_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// MonitorEvent
// ---------------------------------------------------------------------------

/// A tagged lifecycle event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    TaskCreated {
        task_id: String,
    },
    TaskQueued {
        task_id: String,
    },
    TaskRunning {
        task_id: String,
    },
    TaskRetryScheduled {
        task_id: String,
        attempt: u32,
        next_retry_at: i64,
        backoff_ms: i64,
    },
    TaskTimeoutWarning {
        task_id: String,
        ms_until_timeout: i64,
    },
    TaskTimeout {
        task_id: String,
        reason: String,
        timestamp: i64,
    },
    TaskSucceeded {
        task_id: String,
        result: Option<serde_json::Value>,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    SubagentSpawned {
        subagent_id: String,
        task: String,
        parent_session_key: String,
        parent_task_id: String,
    },
    MessageReceived {
        session_key: String,
        channel: String,
    },
    MessageQueued {
        session_key: String,
        queue_len: usize,
    },
    MessageDropped {
        session_key: String,
        reason: String,
    },
    MessageProcessing {
        session_key: String,
        message_id: String,
    },
    MessageProcessed {
        session_key: String,
        duration_ms: i64,
        success: bool,
    },
    ErrorOccurred {
        error_type: String,
        severity: String,
        message: String,
        context: Option<serde_json::Value>,
    },
}

impl MonitorEvent {
    /// The snake_case tag subscribers register interest by.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::TaskCreated { .. } => "task_created",
            MonitorEvent::TaskQueued { .. } => "task_queued",
            MonitorEvent::TaskRunning { .. } => "task_running",
            MonitorEvent::TaskRetryScheduled { .. } => "task_retry_scheduled",
            MonitorEvent::TaskTimeoutWarning { .. } => "task_timeout_warning",
            MonitorEvent::TaskTimeout { .. } => "task_timeout",
            MonitorEvent::TaskSucceeded { .. } => "task_succeeded",
            MonitorEvent::TaskFailed { .. } => "task_failed",
            MonitorEvent::SubagentSpawned { .. } => "subagent_spawned",
            MonitorEvent::MessageReceived { .. } => "message_received",
            MonitorEvent::MessageQueued { .. } => "message_queued",
            MonitorEvent::MessageDropped { .. } => "message_dropped",
            MonitorEvent::MessageProcessing { .. } => "message_processing",
            MonitorEvent::MessageProcessed { .. } => "message_processed",
            MonitorEvent::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorBus
// ---------------------------------------------------------------------------

/// Cloneable handle to the process-wide event channel.
///
/// Created once at startup and handed to every component; cloning is
/// cheap (a `broadcast::Sender` clone).
#[derive(Clone)]
pub struct MonitorBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorBus {
    /// Create a fresh bus (one per process, or per test).
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Best-effort; events with no live subscriber
    /// are dropped silently.
    pub fn emit(&self, event: MonitorEvent) {
        tracing::trace!(kind = event.kind(), "monitor event");
        let _ = self.tx.send(event);
    }

    /// Obtain an independent receiver seeing all events sent after this
    /// call.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

impl Default for MonitorBus {
    fn default() -> Self {
        Self::new()
    }
}
