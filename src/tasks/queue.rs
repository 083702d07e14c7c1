//! Lane-partitioned task execution with per-task retries.
//!
//! Three FIFO lanes (Main, Autonomous, Maintenance) each run up to
//! their concurrency cap. Jobs are re-runnable closures; a failing run
//! schedules a delayed retry with exponential backoff until the task's
//! attempt budget is spent. Lanes never drop work; tasks are
//! persisted, so queue growth is a resource concern, not a
//! correctness one.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Lane, Task, TaskStatus, TaskStore};
use crate::config::TasksConfig;
use crate::events::{MonitorBus, MonitorEvent};

/// A re-runnable unit of task work.
pub type TaskJob = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

struct LaneState {
    cap: usize,
    running: usize,
    queue: VecDeque<(String, TaskJob)>,
}

/// Lane-partitioned work queue over a [`TaskStore`].
pub struct TaskQueue {
    store: Arc<TaskStore>,
    bus: MonitorBus,
    cfg: TasksConfig,
    lanes: Mutex<HashMap<Lane, LaneState>>,
}

impl TaskQueue {
    pub fn new(store: Arc<TaskStore>, bus: MonitorBus, cfg: TasksConfig) -> Arc<Self> {
        let lanes = HashMap::from([
            (
                Lane::Main,
                LaneState {
                    cap: cfg.main_concurrency.max(1),
                    running: 0,
                    queue: VecDeque::new(),
                },
            ),
            (
                Lane::Autonomous,
                LaneState {
                    cap: cfg.autonomous_concurrency.max(1),
                    running: 0,
                    queue: VecDeque::new(),
                },
            ),
            (
                Lane::Maintenance,
                LaneState {
                    cap: cfg.maintenance_concurrency.max(1),
                    running: 0,
                    queue: VecDeque::new(),
                },
            ),
        ]);
        Arc::new(Self {
            store,
            bus,
            cfg,
            lanes: Mutex::new(lanes),
        })
    }

    /// Queue a task's job on its lane. The task transitions to
    /// `queued` and runs as soon as a lane slot frees.
    pub async fn enqueue(self: &Arc<Self>, task_id: &str, lane: Lane, job: TaskJob) {
        if let Err(e) = self
            .store
            .update_status(task_id, TaskStatus::Queued, None)
            .await
        {
            warn!(task_id, error = %e, "enqueue: status update failed");
        }
        self.bus.emit(MonitorEvent::TaskQueued {
            task_id: task_id.to_string(),
        });

        {
            let mut lanes = self.lanes.lock().await;
            if let Some(state) = lanes.get_mut(&lane) {
                state.queue.push_back((task_id.to_string(), job));
            }
        }
        self.pump(lane).await;
    }

    /// Build a task carrying this queue's configured defaults for
    /// timeout, attempt budget, and retry base. Apply per-task
    /// overrides on the result.
    pub fn build_task(
        &self,
        description: impl Into<String>,
        session_key: impl Into<String>,
        lane: Lane,
    ) -> Task {
        Task::new(description, session_key, lane).with_defaults(&self.cfg)
    }

    /// Create, persist, and enqueue a subagent task under `parent`.
    ///
    /// The subagent runs its phases under a derived session key and
    /// inherits the parent's lane along with the configured task
    /// defaults.
    pub async fn spawn_subagent(
        self: &Arc<Self>,
        parent: &Task,
        description: impl Into<String>,
        job: TaskJob,
    ) -> anyhow::Result<Task> {
        let mut task = self.build_task(description, parent.session_key.clone(), parent.lane);
        task.parent_id = Some(parent.id.clone());
        task.subagent_session_key = Some(format!("{}:sub:{}", parent.session_key, task.id));
        let task = self.store.create(task).await?;

        self.bus.emit(MonitorEvent::TaskCreated {
            task_id: task.id.clone(),
        });
        self.bus.emit(MonitorEvent::SubagentSpawned {
            subagent_id: task.id.clone(),
            task: task.description.clone(),
            parent_session_key: parent.session_key.clone(),
            parent_task_id: parent.id.clone(),
        });

        self.enqueue(&task.id, task.lane, job).await;
        Ok(task)
    }

    /// Queue a task after `delay` elapses (retry scheduling, replayed
    /// `next_retry_at` deadlines).
    pub fn enqueue_with_delay(
        self: &Arc<Self>,
        task_id: &str,
        lane: Lane,
        job: TaskJob,
        delay: Duration,
    ) {
        let queue = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(&task_id, lane, job).await;
        });
    }

    /// Drain ready work into running slots.
    fn pump(self: &Arc<Self>, lane: Lane) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        loop {
            let next = {
                let mut lanes = self.lanes.lock().await;
                let Some(state) = lanes.get_mut(&lane) else {
                    return;
                };
                if state.running >= state.cap {
                    return;
                }
                match state.queue.pop_front() {
                    Some(item) => {
                        state.running += 1;
                        item
                    }
                    None => return,
                }
            };

            let queue = self.clone();
            tokio::spawn(async move {
                queue.run_one(next.0, lane, next.1).await;
                {
                    let mut lanes = queue.lanes.lock().await;
                    if let Some(state) = lanes.get_mut(&lane) {
                        state.running = state.running.saturating_sub(1);
                    }
                }
                queue.pump(lane).await;
            });
        }
        })
    }

    /// Execute one attempt and apply the retry policy to the outcome.
    async fn run_one(self: &Arc<Self>, task_id: String, lane: Lane, job: TaskJob) {
        let task = match self
            .store
            .update(&task_id, |t| {
                t.status = TaskStatus::Running;
                t.started_at = Some(crate::utils::now_ms());
                t.retries.attempted += 1;
                t.retries.next_retry_at = None;
            })
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "run: task vanished");
                return;
            }
        };
        self.bus.emit(MonitorEvent::TaskRunning {
            task_id: task_id.clone(),
        });

        match job().await {
            Ok(result) => {
                // The timeout monitor may have already failed the
                // task; a late result is ignored.
                let current = self.store.get(&task_id).await.ok().flatten();
                if current.is_some_and(|t| t.status.is_terminal()) {
                    debug!(task_id = %task_id, "result arrived after terminal status, ignored");
                    return;
                }
                let _ = self.store.set_result(&task_id, result.clone()).await;
                let _ = self
                    .store
                    .update_status(&task_id, TaskStatus::Succeeded, None)
                    .await;
                self.bus.emit(MonitorEvent::TaskSucceeded {
                    task_id: task_id.clone(),
                    result: Some(result),
                });
            }
            Err(e) => {
                let current = self.store.get(&task_id).await.ok().flatten();
                if current.as_ref().is_some_and(|t| t.status.is_terminal()) {
                    debug!(task_id = %task_id, "failure arrived after terminal status, ignored");
                    return;
                }
                let attempted = task.retries.attempted;
                if attempted < task.retries.max_attempts {
                    let backoff = self.backoff_for(&task, attempted);
                    let next_retry_at = crate::utils::now_ms() + backoff;
                    let note = format!("attempt {attempted} failed: {e}");
                    let _ = self
                        .store
                        .update(&task_id, |t| {
                            t.status = TaskStatus::Retrying;
                            t.error = Some(note.clone());
                            t.retries.next_retry_at = Some(next_retry_at);
                            t.retries.backoff_ms = Some(backoff);
                        })
                        .await;
                    self.bus.emit(MonitorEvent::TaskRetryScheduled {
                        task_id: task_id.clone(),
                        attempt: attempted,
                        next_retry_at,
                        backoff_ms: backoff,
                    });
                    self.enqueue_with_delay(
                        &task_id,
                        lane,
                        job,
                        Duration::from_millis(backoff.max(0) as u64),
                    );
                } else {
                    let _ = self
                        .store
                        .update_status(&task_id, TaskStatus::Failed, Some(&e.to_string()))
                        .await;
                    self.bus.emit(MonitorEvent::TaskFailed {
                        task_id: task_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Backoff before retry `attempt` (1-based): the task's original
    /// base scaled by `multiplier^(attempt-1)`, capped by config.
    ///
    /// Only `base_backoff_ms` feeds the calculation; the scaled result
    /// recorded in `retries.backoff_ms` never does, so the same
    /// attempt number always yields the same delay.
    fn backoff_for(&self, task: &Task, attempt: u32) -> i64 {
        let base = task
            .retries
            .base_backoff_ms
            .filter(|b| *b > 0)
            .unwrap_or(self.cfg.retry_backoff_ms);
        let scaled =
            base as f64 * self.cfg.retry_multiplier.powi(attempt.saturating_sub(1) as i32);
        (scaled as i64).min(self.cfg.retry_cap_ms)
    }

    /// Block until the task reaches a terminal status, or fail with
    /// `task_wait_timeout`. The task itself keeps running either way.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.store.get(task_id).await? {
                if task.status.is_terminal() {
                    return Ok(task);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("task_wait_timeout for task {task_id}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// (queued, running) depth per lane, for the duty-cycle report.
    pub async fn lane_depths(&self) -> HashMap<Lane, (usize, usize)> {
        let lanes = self.lanes.lock().await;
        lanes
            .iter()
            .map(|(lane, state)| (*lane, (state.queue.len(), state.running)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Task;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fixture(cfg: TasksConfig) -> (tempfile::TempDir, Arc<TaskStore>, MonitorBus, Arc<TaskQueue>) {
        let dir = tempfile::TempDir::new().unwrap();
        // Zero cache TTL so tests observe disk truth immediately.
        let store = Arc::new(TaskStore::open(dir.path(), 0).await.unwrap());
        let bus = MonitorBus::new();
        let queue = TaskQueue::new(store.clone(), bus.clone(), cfg);
        (dir, store, bus, queue)
    }

    fn fast_cfg() -> TasksConfig {
        TasksConfig {
            retry_backoff_ms: 10,
            retry_multiplier: 2.0,
            retry_cap_ms: 40,
            ..TasksConfig::default()
        }
    }

    #[tokio::test]
    async fn successful_job_reaches_succeeded() {
        let (_dir, store, _bus, queue) = fixture(fast_cfg()).await;
        let task = store
            .create(Task::new("work", "s", Lane::Autonomous))
            .await
            .unwrap();

        let job: TaskJob = Arc::new(|| Box::pin(async { Ok(serde_json::json!({"done": true})) }));
        queue.enqueue(&task.id, Lane::Autonomous, job).await;

        let done = queue
            .wait_for_completion(&task.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.unwrap()["done"], true);
        assert_eq!(done.retries.attempted, 1);
    }

    #[tokio::test]
    async fn failing_job_retries_with_backoff_then_fails() {
        let (_dir, store, bus, queue) = fixture(fast_cfg()).await;
        let mut rx = bus.subscribe();
        let task = store
            .create(
                Task::new("flaky", "s", Lane::Main).with_max_attempts(3),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_job = calls.clone();
        let job: TaskJob = Arc::new(move || {
            calls_in_job.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { anyhow::bail!("nope") })
        });
        queue.enqueue(&task.id, Lane::Main, job).await;

        let done = queue
            .wait_for_completion(&task.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.retries.attempted, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Event order: queued, running, retry(1, 10ms), queued,
        // running, retry(2, 20ms), queued, running, failed.
        let mut kinds = Vec::new();
        let mut backoffs = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let MonitorEvent::TaskRetryScheduled { attempt, backoff_ms, .. } = &ev {
                backoffs.push((*attempt, *backoff_ms));
            }
            kinds.push(ev.kind());
        }
        assert_eq!(backoffs, vec![(1, 10), (2, 20)]);
        assert_eq!(kinds.last(), Some(&"task_failed"));
        assert_eq!(kinds.iter().filter(|k| **k == "task_running").count(), 3);
    }

    #[tokio::test]
    async fn backoff_stays_geometric_beyond_two_retries() {
        // Each retry must scale the ORIGINAL base, not the previously
        // scheduled backoff: 10, 20, 40 — never 10, 20, 80.
        let (_dir, store, bus, queue) = fixture(TasksConfig {
            retry_backoff_ms: 10,
            retry_multiplier: 2.0,
            retry_cap_ms: 60_000,
            ..TasksConfig::default()
        })
        .await;
        let mut rx = bus.subscribe();
        let task = store
            .create(Task::new("stubborn", "s", Lane::Main).with_max_attempts(4))
            .await
            .unwrap();

        let job: TaskJob = Arc::new(|| Box::pin(async { anyhow::bail!("still no") }));
        queue.enqueue(&task.id, Lane::Main, job).await;
        queue
            .wait_for_completion(&task.id, Duration::from_secs(10))
            .await
            .unwrap();

        let mut backoffs = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let MonitorEvent::TaskRetryScheduled { attempt, backoff_ms, .. } = ev {
                backoffs.push((attempt, backoff_ms));
            }
        }
        assert_eq!(backoffs, vec![(1, 10), (2, 20), (3, 40)]);

        // The original base survives untouched on disk.
        let done = store.get(&task.id).await.unwrap().unwrap();
        assert!(done.retries.base_backoff_ms.is_none());
        assert_eq!(done.retries.backoff_ms, Some(40));
    }

    #[tokio::test]
    async fn per_task_base_overrides_config() {
        let (_dir, store, bus, queue) = fixture(fast_cfg()).await;
        let mut rx = bus.subscribe();
        let task = store
            .create(
                Task::new("custom base", "s", Lane::Main)
                    .with_max_attempts(3)
                    .with_retry_backoff_ms(4),
            )
            .await
            .unwrap();

        let job: TaskJob = Arc::new(|| Box::pin(async { anyhow::bail!("no") }));
        queue.enqueue(&task.id, Lane::Main, job).await;
        queue
            .wait_for_completion(&task.id, Duration::from_secs(10))
            .await
            .unwrap();

        let mut backoffs = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let MonitorEvent::TaskRetryScheduled { backoff_ms, .. } = ev {
                backoffs.push(backoff_ms);
            }
        }
        assert_eq!(backoffs, vec![4, 8]);
    }

    #[tokio::test]
    async fn lane_concurrency_is_capped() {
        let cfg = TasksConfig {
            main_concurrency: 1,
            ..fast_cfg()
        };
        let (_dir, store, _bus, queue) = fixture(cfg).await;

        let peak = Arc::new(AtomicU32::new(0));
        let live = Arc::new(AtomicU32::new(0));
        let mut ids = Vec::new();
        for i in 0..3 {
            let task = store
                .create(Task::new(format!("job {i}"), "s", Lane::Main))
                .await
                .unwrap();
            let peak = peak.clone();
            let live = live.clone();
            let job: TaskJob = Arc::new(move || {
                let peak = peak.clone();
                let live = live.clone();
                Box::pin(async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                })
            });
            queue.enqueue(&task.id, Lane::Main, job).await;
            ids.push(task.id);
        }

        for id in &ids {
            queue
                .wait_for_completion(id, Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_subagent_links_parent_and_emits_event() {
        let (_dir, store, bus, queue) = fixture(fast_cfg()).await;
        let mut rx = bus.subscribe();
        let parent = store
            .create(Task::new("parent work", "telegram:dm:1", Lane::Autonomous))
            .await
            .unwrap();

        let job: TaskJob = Arc::new(|| Box::pin(async { Ok(serde_json::json!("sub done")) }));
        let sub = queue
            .spawn_subagent(&parent, "child work", job)
            .await
            .unwrap();
        assert_eq!(sub.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(sub.lane, Lane::Autonomous);
        let sub_session = sub.subagent_session_key.unwrap();
        assert!(sub_session.starts_with("telegram:dm:1:sub:"));

        // Configured task defaults apply to spawned subagents.
        assert_eq!(sub.timeout_ms, Some(fast_cfg().default_timeout_ms));
        assert_eq!(sub.retries.max_attempts, fast_cfg().default_max_attempts);
        assert_eq!(sub.retries.base_backoff_ms, Some(fast_cfg().retry_backoff_ms));

        let mut saw_spawn = false;
        for _ in 0..4 {
            if let Ok(ev) = rx.try_recv() {
                if let MonitorEvent::SubagentSpawned {
                    subagent_id,
                    parent_task_id,
                    ..
                } = ev
                {
                    assert_eq!(subagent_id, sub.id);
                    assert_eq!(parent_task_id, parent.id);
                    saw_spawn = true;
                }
            }
        }
        assert!(saw_spawn);

        queue
            .wait_for_completion(&sub.id, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_completion_times_out() {
        let (_dir, store, _bus, queue) = fixture(fast_cfg()).await;
        let task = store
            .create(Task::new("slow", "s", Lane::Autonomous))
            .await
            .unwrap();
        let job: TaskJob = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::Value::Null)
            })
        });
        queue.enqueue(&task.id, Lane::Autonomous, job).await;

        let err = queue
            .wait_for_completion(&task.id, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("task_wait_timeout"));
    }

    #[tokio::test]
    async fn delayed_enqueue_waits() {
        let (_dir, store, _bus, queue) = fixture(fast_cfg()).await;
        let task = store
            .create(Task::new("later", "s", Lane::Maintenance))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let job: TaskJob = Arc::new(|| Box::pin(async { Ok(serde_json::Value::Null) }));
        queue.enqueue_with_delay(&task.id, Lane::Maintenance, job, Duration::from_millis(80));

        queue
            .wait_for_completion(&task.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
