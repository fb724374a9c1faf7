use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AgentPhase
// ---------------------------------------------------------------------------

/// Why an agent process was launched. Orthogonal to [`SessionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Executing,
    Qa,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentPhase::Planning => "planning",
            AgentPhase::Executing => "executing",
            AgentPhase::Qa => "qa",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Killed,
}

impl SessionStatus {
    /// Terminal states are one-way: once reached, the status never changes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &SessionStatus) -> bool {
        matches!(
            (self, target),
            (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Error)
                | (SessionStatus::Active, SessionStatus::Killed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Killed => "killed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentSession
// ---------------------------------------------------------------------------

/// One supervised agent subprocess executing a single task phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: Uuid,
    pub task_id: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub phase: AgentPhase,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub progress_file: PathBuf,
    pub log_file: PathBuf,
    pub hooks_config_path: Option<PathBuf>,
    /// Settings file content captured before hooks were installed.
    /// `None` means the file did not exist.
    pub original_settings_content: Option<String>,
    pub exit_code: Option<i32>,
    pub project_path: PathBuf,
    /// Working directory relative to `project_path`, when not the root.
    #[serde(default)]
    pub sub_project_path: Option<PathBuf>,
    /// The literal directive sent to the agent.
    pub command: String,
}

impl AgentSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Task lifecycle states written through the task repository around spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Planning,
    Running,
    Review,
    Done,
    Error,
}

// ---------------------------------------------------------------------------
// QA session types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaMode {
    /// Scoped console / screenshot / verification check.
    Quiet,
    /// Exhaustive walkthrough with accessibility review and annotated screenshots.
    Full,
}

impl fmt::Display for QaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QaMode::Quiet => "quiet",
            QaMode::Full => "full",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaSessionStatus {
    Building,
    /// Reserved. No transition currently sets it.
    Launching,
    Testing,
    Completed,
    Error,
}

impl QaSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QaSessionStatus::Completed | QaSessionStatus::Error)
    }
}

/// One run of the automated two-tier review workflow for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaSession {
    pub id: Uuid,
    pub task_id: String,
    pub mode: QaMode,
    pub status: QaSessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report: Option<QaReport>,
    pub screenshots: Vec<String>,
    pub agent_session_id: Option<Uuid>,
}

impl QaSession {
    pub fn new(task_id: impl Into<String>, mode: QaMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            mode,
            status: QaSessionStatus::Building,
            started_at: Utc::now(),
            completed_at: None,
            report: None,
            screenshots: Vec::new(),
            agent_session_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// QA report types
//
// Field names follow the JSON schema agents are instructed to emit, hence
// camelCase on the wire.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaResult {
    Pass,
    Fail,
    Warnings,
}

impl QaResult {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(QaResult::Pass),
            "fail" => Some(QaResult::Fail),
            "warnings" => Some(QaResult::Warnings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaSeverity {
    Critical,
    Major,
    Minor,
    Cosmetic,
}

impl QaSeverity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(QaSeverity::Critical),
            "major" => Some(QaSeverity::Major),
            "minor" => Some(QaSeverity::Minor),
            "cosmetic" => Some(QaSeverity::Cosmetic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaIssue {
    pub severity: QaSeverity,
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaScreenshot {
    pub label: String,
    pub path: String,
    pub timestamp: String,
    pub annotated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSuite {
    pub lint: CheckOutcome,
    pub typecheck: CheckOutcome,
    pub test: CheckOutcome,
    pub build: CheckOutcome,
    pub docs: CheckOutcome,
}

impl VerificationSuite {
    /// Every check failed. Used wherever the outcome is unknown.
    pub fn all_failed() -> Self {
        Self {
            lint: CheckOutcome::Fail,
            typecheck: CheckOutcome::Fail,
            test: CheckOutcome::Fail,
            build: CheckOutcome::Fail,
            docs: CheckOutcome::Fail,
        }
    }

    pub fn outcomes(&self) -> [CheckOutcome; 5] {
        [self.lint, self.typecheck, self.test, self.build, self.docs]
    }

    pub fn pass_count(&self) -> u32 {
        self.outcomes()
            .iter()
            .filter(|o| **o == CheckOutcome::Pass)
            .count() as u32
    }
}

/// Structured verdict parsed from QA agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaReport {
    pub result: QaResult,
    pub checks_run: u32,
    pub checks_passed: u32,
    pub issues: Vec<QaIssue>,
    pub verification_suite: VerificationSuite,
    pub screenshots: Vec<QaScreenshot>,
    /// Elapsed wall time in milliseconds.
    pub duration: u64,
}

impl QaReport {
    pub fn critical_issue_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == QaSeverity::Critical)
            .count()
    }

    pub fn screenshot_paths(&self) -> Vec<String> {
        self.screenshots.iter().map(|s| s.path.clone()).collect()
    }
}
