use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use at_agents::commands::{RepositoryError, TaskRepository};
use at_core::types::TaskStatus;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub description: String,
    pub status: TaskStatus,
}

/// Process-local task table backing the agent command handlers.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|e| {
            warn!("task store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Insert a task in `backlog`, or replace the description of an existing one.
    pub fn upsert(&self, task_id: impl Into<String>, description: impl Into<String>) {
        let description = description.into();
        self.tasks()
            .entry(task_id.into())
            .and_modify(|t| t.description = description.clone())
            .or_insert(TaskRecord {
                description,
                status: TaskStatus::Backlog,
            });
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks().get(task_id).map(|t| t.status)
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskStore {
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), RepositoryError> {
        match self.tasks().get_mut(task_id) {
            Some(task) => {
                debug!(task_id, from = ?task.status, to = ?status, "task status updated");
                task.status = status;
                Ok(())
            }
            None => Err(RepositoryError(format!("unknown task {task_id}"))),
        }
    }

    async fn task_description(&self, task_id: &str) -> Result<Option<String>, RepositoryError> {
        Ok(self.tasks().get(task_id).map(|t| t.description.clone()))
    }
}
