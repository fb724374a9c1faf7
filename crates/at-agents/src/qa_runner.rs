use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use at_bridge::event_bus::EventBus;
use at_bridge::notifications::{Notification, NotificationSink, NotificationType};
use at_bridge::protocol::QaEvent;
use at_core::config::QaConfig;
use at_core::types::{AgentPhase, QaMode, QaReport, QaResult, QaSession, QaSessionStatus};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::orchestrator::{AgentOrchestrator, OrchestratorError, SpawnRequest};
use crate::prompts;
use crate::qa_report::{create_fallback_report, parse_qa_report};

// ---------------------------------------------------------------------------
// QaContext
// ---------------------------------------------------------------------------

/// What the QA agent is told about the work under review.
#[derive(Debug, Clone, Default)]
pub struct QaContext {
    pub project_path: PathBuf,
    pub task_description: Option<String>,
    pub changed_files: Vec<String>,
    pub plan_excerpt: Option<String>,
}

impl QaContext {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors (internal: every failure ends as a terminal QaSession)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum QaRunError {
    #[error("failed to prepare QA output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Spawn(#[from] OrchestratorError),

    #[error("QA agent did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("QA agent launch task failed: {0}")]
    Launch(#[from] tokio::task::JoinError),
}

/// How a run ended.
enum Outcome {
    Report(QaReport),
    Cancelled,
}

// ---------------------------------------------------------------------------
// QaRunner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QaState {
    sessions: HashMap<Uuid, QaSession>,
    reports: HashMap<String, QaReport>,
    runs: Vec<JoinHandle<()>>,
}

struct QaInner {
    config: QaConfig,
    orchestrator: AgentOrchestrator,
    notifications: Arc<dyn NotificationSink>,
    state: Mutex<QaState>,
    events: EventBus<QaEvent>,
}

/// Runs two-tier (quiet / full) QA reviews on top of the orchestrator.
///
/// Public entry points never fail: every problem ends as a terminal
/// [`QaSession`] whose report explains what went wrong. At most one active
/// session exists per task; starting another returns the running one.
#[derive(Clone)]
pub struct QaRunner {
    inner: Arc<QaInner>,
}

impl QaRunner {
    pub fn new(
        config: QaConfig,
        orchestrator: AgentOrchestrator,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(QaInner {
                config,
                orchestrator,
                notifications,
                state: Mutex::new(QaState::default()),
                events: EventBus::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QaState> {
        self.inner.state.lock().unwrap_or_else(|e| {
            warn!("QA state lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Start a quiet QA run in the background.
    pub fn start_quiet(&self, task_id: &str, context: QaContext) -> QaSession {
        self.start(task_id, QaMode::Quiet, context)
    }

    /// Start a full QA run in the background.
    pub fn start_full(&self, task_id: &str, context: QaContext) -> QaSession {
        self.start(task_id, QaMode::Full, context)
    }

    fn start(&self, task_id: &str, mode: QaMode, context: QaContext) -> QaSession {
        let (session, created) = self.begin(task_id, mode);
        if !created {
            return session;
        }

        let runner = self.clone();
        let run_session = session.clone();
        let handle = tokio::spawn(async move {
            runner.execute(run_session, context).await;
        });

        let mut state = self.state();
        state.runs.retain(|h| !h.is_finished());
        state.runs.push(handle);
        session
    }

    /// Run a QA session to completion and return its final state.
    ///
    /// If a session is already active for the task it is returned as-is.
    pub async fn run_qa_session(&self, task_id: &str, mode: QaMode, context: QaContext) -> QaSession {
        let (session, created) = self.begin(task_id, mode);
        if !created {
            return session;
        }
        self.execute(session, context).await
    }

    /// Look up or create the task's session under one lock.
    fn begin(&self, task_id: &str, mode: QaMode) -> (QaSession, bool) {
        let session = {
            let mut state = self.state();
            if let Some(existing) = state
                .sessions
                .values()
                .find(|s| s.task_id == task_id && s.is_active())
            {
                debug!(task_id, session_id = %existing.id, "QA already running for task");
                return (existing.clone(), false);
            }
            let session = QaSession::new(task_id, mode);
            state.sessions.insert(session.id, session.clone());
            session
        };

        info!(task_id, session_id = %session.id, %mode, "QA session started");
        self.inner.events.publish(QaEvent::Started {
            task_id: task_id.to_string(),
            session_id: session.id,
            mode,
            timestamp: Utc::now(),
        });
        (session, true)
    }

    async fn execute(&self, session: QaSession, context: QaContext) -> QaSession {
        let started = Instant::now();
        let session_id = session.id;

        match self.try_execute(&session, &context, started).await {
            Ok(Outcome::Report(report)) => self.complete(session_id, report),
            Ok(Outcome::Cancelled) => {}
            Err(e) => self.fail(session_id, &e.to_string(), started),
        }

        self.get_session(session_id).unwrap_or(session)
    }

    async fn try_execute(
        &self,
        session: &QaSession,
        context: &QaContext,
        started: Instant,
    ) -> Result<Outcome, QaRunError> {
        let config = &self.inner.config;

        let output_dir = context
            .project_path
            .join(&config.output_dir)
            .join(&session.task_id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| QaRunError::OutputDir {
                path: output_dir.clone(),
                source,
            })?;

        let directive = prompts::qa_directive(session.mode, &session.task_id, context);

        if !self.update(session.id, |s| s.status = QaSessionStatus::Testing) {
            return Ok(Outcome::Cancelled);
        }
        self.progress(session, 2, "Launching QA agent");

        let mut request = SpawnRequest::new(
            session.task_id.clone(),
            context.project_path.clone(),
            directive,
            AgentPhase::Qa,
        );
        request.env = vec![
            ("QA_MODE".to_string(), session.mode.to_string()),
            (
                "QA_OUTPUT_DIR".to_string(),
                output_dir.to_string_lossy().into_owned(),
            ),
        ];
        // The launch runs detached so an aborted run cannot orphan a started
        // agent: whoever finishes second kills it.
        let runner = self.clone();
        let qa_session_id = session.id;
        let launch = tokio::spawn(async move {
            let agent = runner.inner.orchestrator.spawn(request).await?;
            if runner.update(qa_session_id, |s| s.agent_session_id = Some(agent.id)) {
                Ok::<_, OrchestratorError>(Some(agent))
            } else {
                debug!(agent_id = %agent.id, "QA session ended while the agent was launching");
                runner.inner.orchestrator.kill(agent.id).await;
                Ok(None)
            }
        });
        let Some(agent) = launch.await?? else {
            return Ok(Outcome::Cancelled);
        };

        let log_file = agent.log_file.clone();
        if !self.wait_for_agent(session.id, agent.id, started).await? {
            return Ok(Outcome::Cancelled);
        }

        self.progress(session, 3, "Parsing QA report");
        let output = read_log(&log_file).await;
        let elapsed = elapsed_ms(started);
        let report = parse_qa_report(&output, elapsed).unwrap_or_else(|| {
            create_fallback_report(elapsed, Some("no valid QA report found in agent output"))
        });
        Ok(Outcome::Report(report))
    }

    /// Poll until the agent session ends or disappears.
    ///
    /// Returns `false` if the QA session was cancelled meanwhile.
    async fn wait_for_agent(
        &self,
        qa_session_id: Uuid,
        agent_id: Uuid,
        started: Instant,
    ) -> Result<bool, QaRunError> {
        let config = &self.inner.config;
        let orchestrator = &self.inner.orchestrator;
        let max_wait = config.max_wait();

        tokio::time::sleep(config.initial_delay()).await;
        loop {
            if !self.is_active(qa_session_id) {
                return Ok(false);
            }
            match orchestrator.get_session(agent_id).await {
                None => {
                    debug!(%agent_id, "QA agent session pruned, treating as finished");
                    return Ok(true);
                }
                Some(s) if s.status.is_terminal() => return Ok(true),
                Some(_) => {}
            }
            if started.elapsed() >= max_wait {
                orchestrator.kill(agent_id).await;
                return Err(QaRunError::TimedOut(max_wait));
            }
            tokio::time::sleep(config.poll_interval()).await;
        }
    }

    fn complete(&self, session_id: Uuid, report: QaReport) {
        let result = report.result;
        let Some(task_id) = self.finish(session_id, QaSessionStatus::Completed, report.clone())
        else {
            return;
        };
        self.state().reports.insert(task_id.clone(), report.clone());

        info!(task_id = %task_id, %session_id, ?result, checks_run = report.checks_run, "QA session completed");
        self.inner.events.publish(QaEvent::Completed {
            task_id: task_id.clone(),
            session_id,
            result,
            timestamp: Utc::now(),
        });

        if result == QaResult::Fail {
            let critical = report.critical_issue_count();
            self.inner.notifications.on_notification(
                Notification::new(
                    NotificationType::QaFailure,
                    "QA failed",
                    format!(
                        "{} of {} checks passed, {} issue(s), {} critical",
                        report.checks_passed,
                        report.checks_run,
                        report.issues.len(),
                        critical
                    ),
                )
                .with_task(task_id),
            );
        }
    }

    fn fail(&self, session_id: Uuid, message: &str, started: Instant) {
        let report = create_fallback_report(elapsed_ms(started), Some(message));
        let Some(task_id) = self.finish(session_id, QaSessionStatus::Error, report) else {
            return;
        };
        warn!(task_id = %task_id, %session_id, error = message, "QA session failed");
        self.inner.events.publish(QaEvent::Error {
            task_id,
            session_id,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Move an active session to `status`. Returns its task id, or `None` if
    /// it had already ended.
    fn finish(&self, session_id: Uuid, status: QaSessionStatus, report: QaReport) -> Option<String> {
        let mut state = self.state();
        let session = state.sessions.get_mut(&session_id)?;
        if !session.is_active() {
            return None;
        }
        session.status = status;
        session.completed_at = Some(Utc::now());
        session.screenshots = report.screenshot_paths();
        session.report = Some(report);
        Some(session.task_id.clone())
    }

    /// Apply `f` to an active session. `false` if it is gone or terminal.
    fn update(&self, session_id: Uuid, f: impl FnOnce(&mut QaSession)) -> bool {
        let mut state = self.state();
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.is_active() => {
                f(session);
                true
            }
            _ => false,
        }
    }

    fn is_active(&self, session_id: Uuid) -> bool {
        self.state()
            .sessions
            .get(&session_id)
            .is_some_and(QaSession::is_active)
    }

    fn progress(&self, session: &QaSession, current: u32, message: &str) {
        self.inner.events.publish(QaEvent::Progress {
            task_id: session.task_id.clone(),
            session_id: session.id,
            current,
            total: 3,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    // ---- Accessors ----

    pub fn get_session(&self, session_id: Uuid) -> Option<QaSession> {
        self.state().sessions.get(&session_id).cloned()
    }

    /// Most recently started session for `task_id`.
    pub fn get_session_by_task_id(&self, task_id: &str) -> Option<QaSession> {
        self.state()
            .sessions
            .values()
            .filter(|s| s.task_id == task_id)
            .max_by_key(|s| s.started_at)
            .cloned()
    }

    /// Latest report stored for `task_id`.
    pub fn get_report_for_task(&self, task_id: &str) -> Option<QaReport> {
        self.state().reports.get(task_id).cloned()
    }

    pub fn subscribe(&self) -> flume::Receiver<QaEvent> {
        self.inner.events.subscribe()
    }

    /// Stop a run. The backing agent, if any, is killed.
    pub async fn cancel(&self, session_id: Uuid) {
        let started_at = match self.get_session(session_id) {
            Some(s) if s.is_active() => s.started_at,
            _ => return,
        };
        let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        let report = create_fallback_report(elapsed, Some("QA session cancelled"));
        let Some(task_id) = self.finish(session_id, QaSessionStatus::Error, report) else {
            return;
        };
        let agent_id = self
            .get_session(session_id)
            .and_then(|s| s.agent_session_id);

        if let Some(agent_id) = agent_id {
            self.inner.orchestrator.kill(agent_id).await;
        }
        info!(task_id = %task_id, %session_id, "QA session cancelled");
        self.inner.events.publish(QaEvent::Error {
            task_id,
            session_id,
            message: "cancelled".to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Kill agents behind active runs and drop all QA state.
    pub async fn dispose(&self) {
        let (agents, runs) = {
            let mut state = self.state();
            let agents: Vec<Uuid> = state
                .sessions
                .values()
                .filter(|s| s.is_active())
                .filter_map(|s| s.agent_session_id)
                .collect();
            let runs = std::mem::take(&mut state.runs);
            state.sessions.clear();
            state.reports.clear();
            (agents, runs)
        };

        for run in runs {
            run.abort();
        }
        for agent_id in &agents {
            self.inner.orchestrator.kill(*agent_id).await;
        }
        info!(killed = agents.len(), "QA runner disposed");
    }
}

/// Agent output may contain arbitrary bytes; decode lossily.
async fn read_log(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read QA agent log");
            }
            String::new()
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
