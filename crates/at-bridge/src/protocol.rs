//! Outward event protocol.
//!
//! Lifecycle events are forwarded to the IPC layer on named channels such as
//! `event:agent.orchestrator.progress` or `event:qa.completed`.

use at_core::types::{QaMode, QaResult, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event that knows which outward channel it belongs on.
pub trait ChannelEvent: Serialize {
    /// Short event name, e.g. `planReady`.
    fn name(&self) -> &'static str;

    /// Fully qualified channel, e.g. `event:agent.orchestrator.planReady`.
    fn channel(&self) -> String;
}

// ---------------------------------------------------------------------------
// Orchestrator events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrchestratorEvent {
    Progress {
        task_id: String,
        session_id: Uuid,
        message: String,
        percent: Option<u8>,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        task_id: String,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    PlanReady {
        task_id: String,
        session_id: Uuid,
        plan_path: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Stopped {
        task_id: String,
        session_id: Uuid,
        status: SessionStatus,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    Error {
        task_id: String,
        session_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Advisory only; the session is not killed.
    WatchdogAlert {
        task_id: String,
        session_id: Uuid,
        silent_for_secs: u64,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn task_id(&self) -> &str {
        match self {
            OrchestratorEvent::Progress { task_id, .. }
            | OrchestratorEvent::Heartbeat { task_id, .. }
            | OrchestratorEvent::PlanReady { task_id, .. }
            | OrchestratorEvent::Stopped { task_id, .. }
            | OrchestratorEvent::Error { task_id, .. }
            | OrchestratorEvent::WatchdogAlert { task_id, .. } => task_id,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            OrchestratorEvent::Progress { session_id, .. }
            | OrchestratorEvent::Heartbeat { session_id, .. }
            | OrchestratorEvent::PlanReady { session_id, .. }
            | OrchestratorEvent::Stopped { session_id, .. }
            | OrchestratorEvent::Error { session_id, .. }
            | OrchestratorEvent::WatchdogAlert { session_id, .. } => *session_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestratorEvent::Progress { timestamp, .. }
            | OrchestratorEvent::Heartbeat { timestamp, .. }
            | OrchestratorEvent::PlanReady { timestamp, .. }
            | OrchestratorEvent::Stopped { timestamp, .. }
            | OrchestratorEvent::Error { timestamp, .. }
            | OrchestratorEvent::WatchdogAlert { timestamp, .. } => *timestamp,
        }
    }
}

impl ChannelEvent for OrchestratorEvent {
    fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::Progress { .. } => "progress",
            OrchestratorEvent::Heartbeat { .. } => "heartbeat",
            OrchestratorEvent::PlanReady { .. } => "planReady",
            OrchestratorEvent::Stopped { .. } => "stopped",
            OrchestratorEvent::Error { .. } => "error",
            OrchestratorEvent::WatchdogAlert { .. } => "watchdogAlert",
        }
    }

    fn channel(&self) -> String {
        format!("event:agent.orchestrator.{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// QA events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QaEvent {
    Started {
        task_id: String,
        session_id: Uuid,
        mode: QaMode,
        timestamp: DateTime<Utc>,
    },
    Progress {
        task_id: String,
        session_id: Uuid,
        current: u32,
        total: u32,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        task_id: String,
        session_id: Uuid,
        result: QaResult,
        timestamp: DateTime<Utc>,
    },
    Error {
        task_id: String,
        session_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl QaEvent {
    pub fn task_id(&self) -> &str {
        match self {
            QaEvent::Started { task_id, .. }
            | QaEvent::Progress { task_id, .. }
            | QaEvent::Completed { task_id, .. }
            | QaEvent::Error { task_id, .. } => task_id,
        }
    }

    /// The QA session id (not the backing agent session).
    pub fn session_id(&self) -> Uuid {
        match self {
            QaEvent::Started { session_id, .. }
            | QaEvent::Progress { session_id, .. }
            | QaEvent::Completed { session_id, .. }
            | QaEvent::Error { session_id, .. } => *session_id,
        }
    }
}

impl ChannelEvent for QaEvent {
    fn name(&self) -> &'static str {
        match self {
            QaEvent::Started { .. } => "started",
            QaEvent::Progress { .. } => "progress",
            QaEvent::Completed { .. } => "completed",
            QaEvent::Error { .. } => "error",
        }
    }

    fn channel(&self) -> String {
        format!("event:qa.{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// ForwardedEvent
// ---------------------------------------------------------------------------

/// Envelope published to the IPC layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedEvent {
    pub channel: String,
    pub payload: serde_json::Value,
}

impl ForwardedEvent {
    pub fn from_event<E: ChannelEvent>(event: &E) -> serde_json::Result<Self> {
        Ok(Self {
            channel: event.channel(),
            payload: serde_json::to_value(event)?,
        })
    }
}
