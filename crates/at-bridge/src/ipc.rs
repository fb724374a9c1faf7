//! Schema validation for agent IPC commands.
//!
//! Payloads arrive as loose JSON with camelCase keys. [`validate_request`]
//! turns them into typed requests or rejects them with an error naming the
//! offending field, before any handler runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Command names
// ---------------------------------------------------------------------------

pub const START_PLANNING: &str = "agent.startPlanning";
pub const START_EXECUTION: &str = "agent.startExecution";
pub const REPLAN_WITH_FEEDBACK: &str = "agent.replanWithFeedback";
pub const KILL_SESSION: &str = "agent.killSession";
pub const RESTART_FROM_CHECKPOINT: &str = "agent.restartFromCheckpoint";
pub const GET_ORCHESTRATOR_SESSION: &str = "agent.getOrchestratorSession";
pub const LIST_ORCHESTRATOR_SESSIONS: &str = "agent.listOrchestratorSessions";

pub const AGENT_COMMANDS: &[&str] = &[
    START_PLANNING,
    START_EXECUTION,
    REPLAN_WITH_FEEDBACK,
    KILL_SESSION,
    RESTART_FROM_CHECKPOINT,
    GET_ORCHESTRATOR_SESSION,
    LIST_ORCHESTRATOR_SESSIONS,
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command}: payload must be a JSON object")]
    NotAnObject { command: String },

    #[error("{command}: missing required field '{field}'")]
    MissingField { command: String, field: String },

    #[error("{command}: invalid field '{field}': {reason}")]
    InvalidField {
        command: String,
        field: String,
        reason: String,
    },
}

impl ValidationError {
    /// The field the error refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::MissingField { field, .. }
            | ValidationError::InvalidField { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

// ---------------------------------------------------------------------------
// Typed requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPlanningRequest {
    pub task_id: String,
    pub project_path: String,
    /// Overrides the description stored for the task.
    pub description: Option<String>,
    pub sub_project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    pub task_id: String,
    pub project_path: String,
    pub description: Option<String>,
    pub plan_ref: Option<String>,
    pub sub_project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplanRequest {
    pub task_id: String,
    pub project_path: String,
    pub feedback: String,
    pub sub_project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillSessionRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    pub task_id: String,
    pub project_path: String,
    /// Defaults to the sub-project of the task's previous session.
    pub sub_project_path: Option<String>,
}

/// Look up by session id, or by task id when no session id is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSessionRequest {
    pub session_id: Option<Uuid>,
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    StartPlanning(StartPlanningRequest),
    StartExecution(StartExecutionRequest),
    ReplanWithFeedback(ReplanRequest),
    KillSession(KillSessionRequest),
    RestartFromCheckpoint(RestartRequest),
    GetOrchestratorSession(GetSessionRequest),
    ListOrchestratorSessions,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `payload` against the schema of `command`.
pub fn validate_request(command: &str, payload: &Value) -> Result<AgentRequest> {
    let fields = Fields::new(command, payload)?;
    let request = match command {
        START_PLANNING => AgentRequest::StartPlanning(StartPlanningRequest {
            task_id: fields.required_str("taskId")?,
            project_path: fields.required_str("projectPath")?,
            description: fields.optional_str("description")?,
            sub_project_path: fields.optional_str("subProjectPath")?,
        }),
        START_EXECUTION => AgentRequest::StartExecution(StartExecutionRequest {
            task_id: fields.required_str("taskId")?,
            project_path: fields.required_str("projectPath")?,
            description: fields.optional_str("description")?,
            plan_ref: fields.optional_str("planRef")?,
            sub_project_path: fields.optional_str("subProjectPath")?,
        }),
        REPLAN_WITH_FEEDBACK => AgentRequest::ReplanWithFeedback(ReplanRequest {
            task_id: fields.required_str("taskId")?,
            project_path: fields.required_str("projectPath")?,
            feedback: fields.required_str("feedback")?,
            sub_project_path: fields.optional_str("subProjectPath")?,
        }),
        KILL_SESSION => AgentRequest::KillSession(KillSessionRequest {
            session_id: fields.required_uuid("sessionId")?,
        }),
        RESTART_FROM_CHECKPOINT => AgentRequest::RestartFromCheckpoint(RestartRequest {
            task_id: fields.required_str("taskId")?,
            project_path: fields.required_str("projectPath")?,
            sub_project_path: fields.optional_str("subProjectPath")?,
        }),
        GET_ORCHESTRATOR_SESSION => {
            let session_id = fields.optional_uuid("sessionId")?;
            let task_id = fields.optional_str("taskId")?;
            if session_id.is_none() && task_id.is_none() {
                return Err(fields.missing("sessionId"));
            }
            AgentRequest::GetOrchestratorSession(GetSessionRequest {
                session_id,
                task_id,
            })
        }
        LIST_ORCHESTRATOR_SESSIONS => AgentRequest::ListOrchestratorSessions,
        other => return Err(ValidationError::UnknownCommand(other.to_string())),
    };
    Ok(request)
}

/// Field accessor over one payload object.
struct Fields<'a> {
    command: &'a str,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(command: &'a str, payload: &'a Value) -> Result<Self> {
        if !AGENT_COMMANDS.contains(&command) {
            return Err(ValidationError::UnknownCommand(command.to_string()));
        }
        match payload {
            Value::Object(map) => Ok(Self {
                command,
                map: Some(map),
            }),
            // Commands without required fields may omit the payload.
            Value::Null => Ok(Self { command, map: None }),
            _ => Err(ValidationError::NotAnObject {
                command: command.to_string(),
            }),
        }
    }

    fn missing(&self, field: &str) -> ValidationError {
        ValidationError::MissingField {
            command: self.command.to_string(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: &str) -> ValidationError {
        ValidationError::InvalidField {
            command: self.command.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.map
            .and_then(|m| m.get(field))
            .filter(|v| !v.is_null())
    }

    fn optional_str(&self, field: &str) -> Result<Option<String>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(self.invalid(field, "must not be empty"))
            }
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(field, "expected a string")),
        }
    }

    fn required_str(&self, field: &str) -> Result<String> {
        self.optional_str(field)?.ok_or_else(|| self.missing(field))
    }

    fn optional_uuid(&self, field: &str) -> Result<Option<Uuid>> {
        match self.optional_str(field)? {
            None => Ok(None),
            Some(s) => Uuid::parse_str(&s)
                .map(Some)
                .map_err(|_| self.invalid(field, "expected a UUID")),
        }
    }

    fn required_uuid(&self, field: &str) -> Result<Uuid> {
        self.optional_uuid(field)?.ok_or_else(|| self.missing(field))
    }
}
