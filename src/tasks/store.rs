//! Crash-safe task persistence: one JSON file per task plus an index.
//!
//! Writes are serialized per task id; reads go through a TTL cache.
//! On startup [`TaskStore::active_tasks`] yields every task whose
//! status is `queued`, `running`, or `retrying` so the supervisor can
//! replay them into the queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Task, TaskStatus};

/// Filename of the id → status index kept beside the task files.
const INDEX_FILE: &str = "index.json";

struct CacheEntry {
    task: Task,
    cached_at: i64,
}

/// Disk-backed task store with an in-memory read cache.
pub struct TaskStore {
    dir: PathBuf,
    cache_ttl_ms: i64,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Per-id write locks so concurrent updates to one task serialize
    /// while distinct tasks proceed in parallel.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: &Path, cache_ttl_ms: i64) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create task dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache_ttl_ms,
            cache: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn persist(&self, task: &Task) -> anyhow::Result<()> {
        let path = self.task_path(&task.id);
        let json = serde_json::to_string_pretty(task).context("serialize task")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;

        self.cache.lock().await.insert(
            task.id.clone(),
            CacheEntry {
                task: task.clone(),
                cached_at: crate::utils::now_ms(),
            },
        );
        self.update_index(task).await;
        Ok(())
    }

    /// Best-effort index maintenance; the per-task files remain the
    /// source of truth.
    async fn update_index(&self, task: &Task) {
        let path = self.dir.join(INDEX_FILE);
        let mut index: HashMap<String, String> = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        index.insert(task.id.clone(), task.status.as_str().to_string());
        if let Ok(json) = serde_json::to_string_pretty(&index) {
            if let Err(e) = fs::write(&path, json).await {
                warn!(error = %e, "task index write failed");
            }
        }
    }

    // -- operations ---------------------------------------------------------

    /// Persist a freshly built task. The record must be new; an
    /// existing file for the same id is an error.
    pub async fn create(&self, task: Task) -> anyhow::Result<Task> {
        let lock = self.lock_for(&task.id).await;
        let _guard = lock.lock().await;
        let path = self.task_path(&task.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            anyhow::bail!("task {} already exists", task.id);
        }
        self.persist(&task).await?;
        debug!(task_id = %task.id, lane = task.lane.as_str(), "task created");
        Ok(task)
    }

    /// Fetch a task by id, via the cache when fresh.
    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Task>> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(id) {
                if crate::utils::now_ms() - entry.cached_at < self.cache_ttl_ms {
                    return Ok(Some(entry.task.clone()));
                }
            }
        }

        let path = self.task_path(id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let task: Task =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        self.cache.lock().await.insert(
            id.to_string(),
            CacheEntry {
                task: task.clone(),
                cached_at: crate::utils::now_ms(),
            },
        );
        Ok(Some(task))
    }

    /// Apply a mutation under the task's write lock and persist the
    /// result. Returns the updated record.
    pub async fn update<F>(&self, id: &str, mutate: F) -> anyhow::Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        // Re-read inside the lock so concurrent updates compose.
        let path = self.task_path(id);
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("task {id} not found"))?;
        let mut task: Task =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

        mutate(&mut task);
        self.persist(&task).await?;
        Ok(task)
    }

    /// Transition a task's status, stamping `ended_at` on terminal
    /// states and recording an optional note in `error`.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        note: Option<&str>,
    ) -> anyhow::Result<Task> {
        self.update(id, |task| {
            if !task.status.can_transition(status) && task.status != status {
                warn!(
                    task_id = %task.id,
                    from = task.status.as_str(),
                    to = status.as_str(),
                    "irregular status transition"
                );
            }
            task.status = status;
            match status {
                TaskStatus::Running => task.started_at = Some(crate::utils::now_ms()),
                s if s.is_terminal() => task.ended_at = Some(crate::utils::now_ms()),
                _ => {}
            }
            if let Some(note) = note {
                task.error = Some(note.to_string());
            }
        })
        .await
    }

    /// Store a task's result payload.
    pub async fn set_result(&self, id: &str, result: serde_json::Value) -> anyhow::Result<Task> {
        self.update(id, |task| task.result = Some(result)).await
    }

    /// Load every task file in the directory. Malformed files are
    /// skipped with a warning.
    pub async fn list(&self) -> anyhow::Result<Vec<Task>> {
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read task dir {}", self.dir.display()))?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or_default();
            if !name.ends_with(".json") || name == INDEX_FILE {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(raw) => match serde_json::from_str::<Task>(&raw) {
                    Ok(task) => out.push(task),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed task file"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task file"),
            }
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    /// Tasks that must be replayed after a restart: anything queued,
    /// running, or retrying on disk.
    pub async fn active_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Queued | TaskStatus::Running | TaskStatus::Retrying
                )
            })
            .collect())
    }
}
