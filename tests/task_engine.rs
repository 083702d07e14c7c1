//! Task store, queue, retry, and timeout behavior end to end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use antd::config::TasksConfig;
use antd::events::{MonitorBus, MonitorEvent};
use antd::tasks::queue::TaskJob;
use antd::tasks::{Lane, Task, TaskQueue, TaskStatus, TaskStore, TimeoutMonitor};

fn tasks_cfg() -> TasksConfig {
    TasksConfig {
        retry_backoff_ms: 20,
        retry_multiplier: 2.0,
        retry_cap_ms: 60_000,
        ..TasksConfig::default()
    }
}

async fn fixture() -> (tempfile::TempDir, Arc<TaskStore>, MonitorBus, Arc<TaskQueue>) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path(), 0).await.unwrap());
    let bus = MonitorBus::new();
    let queue = TaskQueue::new(store.clone(), bus.clone(), tasks_cfg());
    (dir, store, bus, queue)
}

#[tokio::test]
async fn retry_backoff_event_sequence() {
    // maxAttempts=3: two scheduled retries with doubled backoff, then
    // a terminal failure.
    let (_dir, store, bus, queue) = fixture().await;
    let mut rx = bus.subscribe();

    let task = store
        .create(Task::new("always fails", "s", Lane::Main).with_max_attempts(3))
        .await
        .unwrap();

    let job: TaskJob = Arc::new(|| Box::pin(async { anyhow::bail!("synthetic") }));
    queue.enqueue(&task.id, Lane::Main, job).await;

    let done = queue
        .wait_for_completion(&task.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.retries.attempted, 3);
    assert!(done.ended_at.is_some());

    let mut kinds = Vec::new();
    let mut retries = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let MonitorEvent::TaskRetryScheduled {
            attempt,
            backoff_ms,
            next_retry_at,
            ..
        } = &ev
        {
            assert!(*next_retry_at > 0);
            retries.push((*attempt, *backoff_ms));
        }
        kinds.push(ev.kind());
    }
    assert_eq!(retries, vec![(1, 20), (2, 40)]);
    let runs = kinds.iter().filter(|k| **k == "task_running").count();
    assert_eq!(runs, 3);
    assert_eq!(kinds.last(), Some(&"task_failed"));
}

#[tokio::test]
async fn attempted_never_exceeds_max_attempts() {
    let (_dir, store, _bus, queue) = fixture().await;
    let task = store
        .create(Task::new("x", "s", Lane::Autonomous).with_max_attempts(2))
        .await
        .unwrap();
    let job: TaskJob = Arc::new(|| Box::pin(async { anyhow::bail!("no") }));
    queue.enqueue(&task.id, Lane::Autonomous, job).await;

    let done = queue
        .wait_for_completion(&task.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(done.retries.attempted <= done.retries.max_attempts);
    assert_eq!(done.retries.attempted, 2);
}

#[tokio::test]
async fn timeout_monitor_fails_overrunning_tasks() {
    let (_dir, store, bus, queue) = fixture().await;
    let monitor = TimeoutMonitor::new(store.clone(), bus.clone(), 1_000, 1_000);
    let mut rx = bus.subscribe();

    let task = store
        .create(
            Task::new("slow", "s", Lane::Autonomous)
                .with_timeout_ms(50)
                .with_max_attempts(1),
        )
        .await
        .unwrap();

    let job: TaskJob = Arc::new(|| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(serde_json::Value::Null)
        })
    });
    queue.enqueue(&task.id, Lane::Autonomous, job).await;

    // Let the task start, then let its budget lapse before scanning.
    tokio::time::sleep(Duration::from_millis(120)).await;
    monitor.scan().await.unwrap();

    let loaded = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert_eq!(loaded.error.as_deref(), Some("timed_out"));

    let mut saw_timeout = false;
    while let Ok(ev) = rx.try_recv() {
        if let MonitorEvent::TaskTimeout { task_id, reason, .. } = ev {
            assert_eq!(task_id, task.id);
            assert_eq!(reason, "timed_out");
            saw_timeout = true;
        }
    }
    assert!(saw_timeout);
}

#[tokio::test]
async fn store_survives_reopen_and_reports_active_tasks() {
    let dir = tempfile::TempDir::new().unwrap();
    let task_id;
    {
        let store = TaskStore::open(dir.path(), 0).await.unwrap();
        let task = store
            .create(Task::new("persisted", "telegram:dm:1", Lane::Autonomous))
            .await
            .unwrap();
        store
            .update_status(&task.id, TaskStatus::Queued, None)
            .await
            .unwrap();
        store
            .update_status(&task.id, TaskStatus::Running, None)
            .await
            .unwrap();
        task_id = task.id;
    }

    // New process: the running task must come back as active.
    let store = TaskStore::open(dir.path(), 0).await.unwrap();
    let active = store.active_tasks().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, task_id);
    assert_eq!(active[0].session_key, "telegram:dm:1");
    assert_eq!(active[0].status, TaskStatus::Running);
}

#[tokio::test]
async fn autonomous_lane_runs_in_parallel() {
    let cfg = TasksConfig {
        autonomous_concurrency: 5,
        ..tasks_cfg()
    };
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path(), 0).await.unwrap());
    let queue = TaskQueue::new(store.clone(), MonitorBus::new(), cfg);

    let peak = Arc::new(AtomicU32::new(0));
    let live = Arc::new(AtomicU32::new(0));
    let mut ids = Vec::new();
    for i in 0..5 {
        let task = store
            .create(Task::new(format!("p{i}"), "s", Lane::Autonomous))
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
                tokio::time::sleep(Duration::from_millis(50)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            })
        });
        queue.enqueue(&task.id, Lane::Autonomous, job).await;
        ids.push(task.id);
    }

    for id in &ids {
        queue
            .wait_for_completion(id, Duration::from_secs(5))
            .await
            .unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) > 1, "lane should overlap work");
}
