//! Ordered phase execution for subagent tasks.
//!
//! A subagent task runs as a fixed sequence of named phases sharing a
//! mutable context. A raising phase fails the task and stops the
//! sequence; completed phases leave their output in the context keyed
//! by phase name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Task, TaskStatus, TaskStore};

/// Mutable context threaded through a task's phases.
#[derive(Debug, Default)]
pub struct PhaseContext {
    /// Intermediate outputs keyed by phase name.
    pub outputs: HashMap<String, serde_json::Value>,
}

impl PhaseContext {
    pub fn output(&self, phase: &str) -> Option<&serde_json::Value> {
        self.outputs.get(phase)
    }
}

/// One named unit within a subagent run. Phases that need a model turn
/// call the agent engine with the task's `subagent_session_key`.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, task: &Task, ctx: &mut PhaseContext)
        -> anyhow::Result<serde_json::Value>;
}

/// Executes phases sequentially with task bookkeeping.
pub struct PhaseExecutor {
    store: Arc<TaskStore>,
    phases: Vec<Arc<dyn Phase>>,
}

impl PhaseExecutor {
    pub fn new(store: Arc<TaskStore>, phases: Vec<Arc<dyn Phase>>) -> Self {
        Self { store, phases }
    }

    /// Run every phase for `task_id` in order.
    ///
    /// On a phase error the task is marked failed with the phase name
    /// recorded, and the error propagates to the caller.
    pub async fn execute(&self, task_id: &str) -> anyhow::Result<PhaseContext> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

        let mut ctx = PhaseContext::default();
        for phase in &self.phases {
            debug!(task_id = %task.id, phase = phase.name(), "phase starting");
            match phase.run(&task, &mut ctx).await {
                Ok(output) => {
                    ctx.outputs.insert(phase.name().to_string(), output);
                }
                Err(e) => {
                    warn!(task_id = %task.id, phase = phase.name(), error = %e, "phase failed");
                    let note = format!("phase {}: {e}", phase.name());
                    self.store
                        .update_status(&task.id, TaskStatus::Failed, Some(&note))
                        .await?;
                    return Err(e.context(format!("phase {}", phase.name())));
                }
            }
        }
        Ok(ctx)
    }
}
