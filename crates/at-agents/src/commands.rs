//! Handlers behind the `agent.*` IPC commands.
//!
//! Every payload is validated by [`at_bridge::ipc::validate_request`] before a
//! handler runs. Task status is written before the spawn; if the spawn fails
//! the task is moved to `error` and the launch error is returned.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use at_bridge::ipc::{
    self, AgentRequest, GetSessionRequest, ReplanRequest, RestartRequest, StartExecutionRequest,
    StartPlanningRequest, ValidationError,
};
use at_core::types::{AgentPhase, AgentSession, TaskStatus};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::{AgentOrchestrator, OrchestratorError, SpawnRequest};
use crate::prompts;

// ---------------------------------------------------------------------------
// TaskRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task repository error: {0}")]
pub struct RepositoryError(pub String);

/// Where task state lives. Not transactional with spawns.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> std::result::Result<(), RepositoryError>;

    /// The task's description, used to build agent directives.
    async fn task_description(
        &self,
        task_id: &str,
    ) -> std::result::Result<Option<String>, RepositoryError>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(ValidationError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ValidationError> for CommandError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::UnknownCommand(name) => CommandError::UnknownCommand(name),
            other => CommandError::Validation(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;

// ---------------------------------------------------------------------------
// AgentCommands
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentCommands {
    orchestrator: AgentOrchestrator,
    tasks: Arc<dyn TaskRepository>,
}

impl AgentCommands {
    pub fn new(orchestrator: AgentOrchestrator, tasks: Arc<dyn TaskRepository>) -> Self {
        Self {
            orchestrator,
            tasks,
        }
    }

    /// Validate `payload` for `command`, run it and encode the result.
    pub async fn dispatch(&self, command: &str, payload: &Value) -> Result<Value> {
        let request = ipc::validate_request(command, payload)?;
        let response = match request {
            AgentRequest::StartPlanning(req) => serde_json::to_value(self.start_planning(req).await?)?,
            AgentRequest::StartExecution(req) => {
                serde_json::to_value(self.start_execution(req).await?)?
            }
            AgentRequest::ReplanWithFeedback(req) => {
                serde_json::to_value(self.replan_with_feedback(req).await?)?
            }
            AgentRequest::KillSession(req) => {
                self.kill_session(req.session_id).await;
                Value::Null
            }
            AgentRequest::RestartFromCheckpoint(req) => {
                serde_json::to_value(self.restart_from_checkpoint(req).await?)?
            }
            AgentRequest::GetOrchestratorSession(req) => {
                serde_json::to_value(self.get_orchestrator_session(req).await)?
            }
            AgentRequest::ListOrchestratorSessions => {
                serde_json::to_value(self.list_orchestrator_sessions().await)?
            }
        };
        Ok(response)
    }

    pub async fn start_planning(&self, req: StartPlanningRequest) -> Result<AgentSession> {
        let description = self
            .resolve_description(&req.task_id, req.description, ipc::START_PLANNING)
            .await?;
        self.launch(
            &req.task_id,
            &req.project_path,
            req.sub_project_path,
            prompts::planning_directive(&description),
            AgentPhase::Planning,
            TaskStatus::Planning,
        )
        .await
    }

    pub async fn start_execution(&self, req: StartExecutionRequest) -> Result<AgentSession> {
        let description = self
            .resolve_description(&req.task_id, req.description, ipc::START_EXECUTION)
            .await?;
        self.launch(
            &req.task_id,
            &req.project_path,
            req.sub_project_path,
            prompts::execution_directive(&description, req.plan_ref.as_deref()),
            AgentPhase::Executing,
            TaskStatus::Running,
        )
        .await
    }

    /// Kill the task's active session, then plan again with the feedback.
    pub async fn replan_with_feedback(&self, req: ReplanRequest) -> Result<AgentSession> {
        let description = self
            .resolve_description(&req.task_id, None, ipc::REPLAN_WITH_FEEDBACK)
            .await?;
        self.kill_active_for_task(&req.task_id).await;
        self.launch(
            &req.task_id,
            &req.project_path,
            req.sub_project_path,
            prompts::replan_directive(&description, &req.feedback),
            AgentPhase::Planning,
            TaskStatus::Planning,
        )
        .await
    }

    pub async fn kill_session(&self, session_id: Uuid) {
        self.orchestrator.kill(session_id).await;
    }

    /// Kill the task's running session, if any, and start executing afresh
    /// in the same sub-project unless the request names another.
    pub async fn restart_from_checkpoint(&self, req: RestartRequest) -> Result<AgentSession> {
        let description = self
            .resolve_description(&req.task_id, None, ipc::RESTART_FROM_CHECKPOINT)
            .await?;
        let previous = self.orchestrator.get_session_by_task_id(&req.task_id).await;
        let sub_project_path = req.sub_project_path.or_else(|| {
            previous
                .as_ref()
                .and_then(|s| s.sub_project_path.as_ref())
                .map(|p| p.to_string_lossy().into_owned())
        });
        self.kill_active_for_task(&req.task_id).await;
        self.launch(
            &req.task_id,
            &req.project_path,
            sub_project_path,
            prompts::execution_directive(&description, None),
            AgentPhase::Executing,
            TaskStatus::Running,
        )
        .await
    }

    pub async fn get_orchestrator_session(&self, req: GetSessionRequest) -> Option<AgentSession> {
        match (req.session_id, req.task_id) {
            (Some(id), _) => self.orchestrator.get_session(id).await,
            (None, Some(task_id)) => self.orchestrator.get_session_by_task_id(&task_id).await,
            (None, None) => None,
        }
    }

    pub async fn list_orchestrator_sessions(&self) -> Vec<AgentSession> {
        self.orchestrator.list_active_sessions().await
    }

    // ---- Helpers ----

    async fn resolve_description(
        &self,
        task_id: &str,
        provided: Option<String>,
        command: &str,
    ) -> Result<String> {
        if let Some(description) = provided {
            return Ok(description);
        }
        match self.tasks.task_description(task_id).await? {
            Some(d) if !d.trim().is_empty() => Ok(d),
            _ => Err(CommandError::Validation(ValidationError::MissingField {
                command: command.to_string(),
                field: "description".to_string(),
            })),
        }
    }

    async fn kill_active_for_task(&self, task_id: &str) {
        if let Some(existing) = self.orchestrator.get_session_by_task_id(task_id).await {
            if existing.is_active() {
                info!(task_id, session_id = %existing.id, "killing current session before respawn");
                self.orchestrator.kill(existing.id).await;
            }
        }
    }

    async fn launch(
        &self,
        task_id: &str,
        project_path: &str,
        sub_project_path: Option<String>,
        prompt: String,
        phase: AgentPhase,
        status: TaskStatus,
    ) -> Result<AgentSession> {
        self.tasks.update_task_status(task_id, status).await?;

        let mut request = SpawnRequest::new(task_id, PathBuf::from(project_path), prompt, phase);
        request.sub_project_path = sub_project_path.map(PathBuf::from);

        match self.orchestrator.spawn(request).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(rollback) = self
                    .tasks
                    .update_task_status(task_id, TaskStatus::Error)
                    .await
                {
                    warn!(task_id, error = %rollback, "failed to roll back task status");
                }
                Err(e.into())
            }
        }
    }
}
