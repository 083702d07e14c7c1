//! Periodic timeout scanning over active tasks.
//!
//! Every `interval_ms` the monitor walks the store's active tasks and
//! compares elapsed run time against each task's `timeout_ms`. A task
//! inside the warning window gets exactly one warning event; a task
//! past its deadline is failed with reason `timed_out`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{TaskStatus, TaskStore};
use crate::events::{MonitorBus, MonitorEvent};

/// Scanner emitting `task_timeout_warning` / `task_timeout` events.
pub struct TimeoutMonitor {
    store: Arc<TaskStore>,
    bus: MonitorBus,
    interval: Duration,
    warning_threshold_ms: i64,
    warned: Mutex<HashSet<String>>,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<TaskStore>,
        bus: MonitorBus,
        interval_ms: u64,
        warning_threshold_ms: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            interval: Duration::from_millis(interval_ms.max(100)),
            warning_threshold_ms,
            warned: Mutex::new(HashSet::new()),
        })
    }

    /// Spawn the scan loop until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("timeout monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.scan().await {
                            warn!(error = %e, "timeout scan failed");
                        }
                    }
                }
            }
        })
    }

    /// One scan pass. Public so tests can drive it without timers.
    pub async fn scan(&self) -> anyhow::Result<()> {
        let now = crate::utils::now_ms();
        let active = self.store.active_tasks().await?;
        let mut still_live: HashSet<String> = HashSet::new();

        for task in active {
            let (Some(timeout_ms), Some(started_at)) = (task.timeout_ms, task.started_at) else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }
            still_live.insert(task.id.clone());

            let ms_until_timeout = started_at + timeout_ms - now;
            if ms_until_timeout <= 0 {
                warn!(task_id = %task.id, "task timed out");
                self.store
                    .update_status(&task.id, TaskStatus::Failed, Some("timed_out"))
                    .await?;
                self.bus.emit(MonitorEvent::TaskTimeout {
                    task_id: task.id.clone(),
                    reason: "timed_out".into(),
                    timestamp: now,
                });
                still_live.remove(&task.id);
            } else if ms_until_timeout <= self.warning_threshold_ms {
                let mut warned = self.warned.lock().await;
                if warned.insert(task.id.clone()) {
                    self.bus.emit(MonitorEvent::TaskTimeoutWarning {
                        task_id: task.id.clone(),
                        ms_until_timeout,
                    });
                }
            }
        }

        // Forget warning marks for tasks that finished or vanished.
        self.warned.lock().await.retain(|id| still_live.contains(id));
        Ok(())
    }
}
