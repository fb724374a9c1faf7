use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use at_bridge::event_bus::EventBus;
use at_bridge::protocol::OrchestratorEvent;
use at_core::config::AgentsConfig;
use at_core::types::{AgentPhase, AgentSession, SessionStatus};
use at_session::launcher::{LaunchError, LaunchSpec, ProcessHandle, ProcessLauncher};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::progress::{self, ProgressLine};
use crate::settings::{HookRegistry, SettingsError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Only [`AgentOrchestrator::spawn`] can fail; every other operation is total.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to launch agent for task {task_id}: {source}")]
    SpawnFailed {
        task_id: String,
        #[source]
        source: LaunchError,
    },

    #[error("session directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// SpawnRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub project_path: PathBuf,
    /// Directive passed to the agent as its final argument.
    pub prompt: String,
    pub phase: AgentPhase,
    /// Working directory relative to `project_path`, for monorepos.
    pub sub_project_path: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(
        task_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
        phase: AgentPhase,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            project_path: project_path.into(),
            prompt: prompt.into(),
            phase,
            sub_project_path: None,
            env: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

struct TrackedSession {
    session: AgentSession,
    process: Arc<ProcessHandle>,
    /// Set once a watchdog alert fired for the current silent stretch.
    alerted: bool,
    progress_offset: u64,
    log_len: u64,
    finished_at: Option<DateTime<Utc>>,
}

impl TrackedSession {
    /// Move an active session to a terminal `status` and release its settings
    /// hooks. Returns `false` if the session had already ended.
    fn finish(
        &mut self,
        status: SessionStatus,
        exit_code: Option<i32>,
        hooks: &HookRegistry,
    ) -> bool {
        if !self.session.status.can_transition_to(&status) {
            return false;
        }
        self.session.status = status;
        self.session.exit_code = exit_code;
        self.finished_at = Some(Utc::now());

        if let Some(path) = self.session.hooks_config_path.as_deref() {
            if let Err(e) = hooks.release(path, &self.session.progress_file) {
                warn!(session_id = %self.session.id, error = %e, "failed to restore agent settings");
            }
        }
        true
    }
}

struct Inner {
    config: AgentsConfig,
    launcher: Arc<dyn ProcessLauncher>,
    sessions: Mutex<HashMap<Uuid, TrackedSession>>,
    events: EventBus<OrchestratorEvent>,
    hooks: HookRegistry,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
    last_sweep: StdMutex<Option<DateTime<Utc>>>,
}

// ---------------------------------------------------------------------------
// AgentOrchestrator
// ---------------------------------------------------------------------------

/// Spawns and supervises one agent process per task phase.
///
/// Sessions move `active -> {completed | error | killed}` and never leave a
/// terminal state. Terminal sessions stay queryable until they age out of
/// the retention window or [`dispose`](Self::dispose) is called.
///
/// The orchestrator does not enforce one session per task. Callers that
/// replace a session kill the old one first.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

impl AgentOrchestrator {
    pub fn new(config: AgentsConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                sessions: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                hooks: HookRegistry::new(),
                watchdog: StdMutex::new(None),
                last_sweep: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AgentsConfig {
        &self.inner.config
    }

    /// Launch an agent and register it as `active`.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<AgentSession> {
        let config = &self.inner.config;
        let id = Uuid::new_v4();
        let cwd = match &req.sub_project_path {
            Some(sub) => req.project_path.join(sub),
            None => req.project_path.clone(),
        };

        let session_dir = req
            .project_path
            .join(&config.session_dir)
            .join(id.to_string());
        tokio::fs::create_dir_all(&session_dir).await?;
        let progress_file = session_dir.join("progress.jsonl");
        let log_file = session_dir.join("agent.log");

        let settings_path = cwd.join(&config.settings_file);
        let original_settings = self.inner.hooks.install(&settings_path, &progress_file)?;

        let mut args = config.args.clone();
        args.push(req.prompt.clone());
        let mut env = req.env.clone();
        env.push(("AUTO_TUNDRA_TASK_ID".into(), req.task_id.clone()));
        env.push(("AUTO_TUNDRA_SESSION_ID".into(), id.to_string()));
        env.push((
            "AUTO_TUNDRA_PROGRESS_FILE".into(),
            progress_file.to_string_lossy().into_owned(),
        ));

        let spec = LaunchSpec {
            program: config.command.clone(),
            args,
            cwd,
            env,
            log_file: log_file.clone(),
        };

        let process = match self.inner.launcher.launch(spec).await {
            Ok(process) => Arc::new(process),
            Err(source) => {
                if let Err(e) = self.inner.hooks.release(&settings_path, &progress_file) {
                    warn!(task_id = %req.task_id, error = %e, "failed to restore agent settings");
                }
                error!(task_id = %req.task_id, phase = %req.phase, error = %source, "agent spawn failed");
                return Err(OrchestratorError::SpawnFailed {
                    task_id: req.task_id,
                    source,
                });
            }
        };

        let now = Utc::now();
        let session = AgentSession {
            id,
            task_id: req.task_id,
            pid: process.pid(),
            status: SessionStatus::Active,
            phase: req.phase,
            spawned_at: now,
            last_heartbeat: now,
            progress_file,
            log_file,
            hooks_config_path: Some(settings_path),
            original_settings_content: original_settings,
            exit_code: None,
            project_path: req.project_path,
            sub_project_path: req.sub_project_path,
            command: req.prompt,
        };

        self.inner.sessions.lock().await.insert(
            id,
            TrackedSession {
                session: session.clone(),
                process: Arc::clone(&process),
                alerted: false,
                progress_offset: 0,
                log_len: 0,
                finished_at: None,
            },
        );

        self.spawn_exit_monitor(id, process);
        self.ensure_watchdog();

        info!(
            session_id = %id,
            task_id = %session.task_id,
            phase = %session.phase,
            pid = ?session.pid,
            "agent session spawned"
        );
        Ok(session)
    }

    /// Best-effort termination. Unknown or already-finished sessions are a no-op.
    pub async fn kill(&self, session_id: Uuid) {
        let event = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(tracked) = sessions.get_mut(&session_id) else {
                debug!(%session_id, "kill for unknown session ignored");
                return;
            };
            if !tracked.finish(SessionStatus::Killed, None, &self.inner.hooks) {
                return;
            }
            if !tracked.process.kill() {
                debug!(%session_id, "process already gone");
            }
            stopped_event(&tracked.session)
        };
        info!(%session_id, "agent session killed");
        self.inner.events.publish(event);
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<AgentSession> {
        self.inner
            .sessions
            .lock()
            .await
            .get(&session_id)
            .map(|t| t.session.clone())
    }

    /// Most recently spawned session for `task_id`, whatever its status.
    pub async fn get_session_by_task_id(&self, task_id: &str) -> Option<AgentSession> {
        self.inner
            .sessions
            .lock()
            .await
            .values()
            .filter(|t| t.session.task_id == task_id)
            .max_by_key(|t| t.session.spawned_at)
            .map(|t| t.session.clone())
    }

    /// Every tracked session, including ones that already finished, oldest first.
    pub async fn list_active_sessions(&self) -> Vec<AgentSession> {
        let mut out: Vec<AgentSession> = self
            .inner
            .sessions
            .lock()
            .await
            .values()
            .map(|t| t.session.clone())
            .collect();
        out.sort_by_key(|s| s.spawned_at);
        out
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> flume::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// When the watchdog last ran.
    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sweep.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one watchdog pass against the current wall clock.
    pub async fn check_sessions(&self) {
        self.check_sessions_at(Utc::now()).await;
    }

    /// Run one watchdog pass as if the time were `now`.
    ///
    /// Reads new progress lines, treats log growth as a heartbeat, raises a
    /// `watchdogAlert` once per silent stretch and prunes terminal sessions
    /// past the retention window.
    pub async fn check_sessions_at(&self, now: DateTime<Utc>) {
        let timeout = to_chrono(self.inner.config.watchdog_timeout());
        let retention = to_chrono(self.inner.config.session_retention());

        let mut events = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock().await;

            for tracked in sessions.values_mut().filter(|t| t.session.is_active()) {
                let session_id = tracked.session.id;
                let task_id = tracked.session.task_id.clone();

                let batch =
                    progress::read_new_lines(&tracked.session.progress_file, tracked.progress_offset);
                tracked.progress_offset = batch.next_offset;
                let mut alive = !batch.lines.is_empty();

                for line in batch.lines {
                    match line {
                        ProgressLine::Heartbeat => events.push(OrchestratorEvent::Heartbeat {
                            task_id: task_id.clone(),
                            session_id,
                            timestamp: now,
                        }),
                        ProgressLine::Progress { message, percent } => {
                            events.push(OrchestratorEvent::Progress {
                                task_id: task_id.clone(),
                                session_id,
                                message,
                                percent,
                                timestamp: now,
                            })
                        }
                        ProgressLine::PlanReady { plan_path } => {
                            events.push(OrchestratorEvent::PlanReady {
                                task_id: task_id.clone(),
                                session_id,
                                plan_path,
                                timestamp: now,
                            })
                        }
                        ProgressLine::Other(_) => {}
                    }
                }

                if let Some(len) = progress::file_len(&tracked.session.log_file) {
                    if len > tracked.log_len {
                        alive = true;
                    }
                    tracked.log_len = len;
                }

                if alive {
                    tracked.session.last_heartbeat = now;
                    tracked.alerted = false;
                    continue;
                }

                let silent = now.signed_duration_since(tracked.session.last_heartbeat);
                if silent > timeout && !tracked.alerted {
                    tracked.alerted = true;
                    warn!(%session_id, task_id = %task_id, silent_secs = silent.num_seconds(), "agent session silent");
                    events.push(OrchestratorEvent::WatchdogAlert {
                        task_id,
                        session_id,
                        silent_for_secs: silent.num_seconds().max(0) as u64,
                        timestamp: now,
                    });
                }
            }

            let before = sessions.len();
            sessions.retain(|_, t| match t.finished_at {
                Some(at) => now.signed_duration_since(at) <= retention,
                None => true,
            });
            let pruned = before - sessions.len();
            if pruned > 0 {
                debug!(pruned, "pruned finished agent sessions");
            }
        }

        *self.inner.last_sweep.lock().unwrap_or_else(|e| {
            warn!("watchdog sweep lock was poisoned, recovering");
            e.into_inner()
        }) = Some(now);

        for event in events {
            self.inner.events.publish(event);
        }
    }

    /// Kill every active session and forget all state.
    pub async fn dispose(&self) {
        if let Some(handle) = self
            .inner
            .watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let events: Vec<OrchestratorEvent> = {
            let mut sessions = self.inner.sessions.lock().await;
            let events = sessions
                .values_mut()
                .filter_map(|tracked| {
                    tracked.finish(SessionStatus::Killed, None, &self.inner.hooks).then(|| {
                        tracked.process.kill();
                        stopped_event(&tracked.session)
                    })
                })
                .collect();
            sessions.clear();
            events
        };

        info!(killed = events.len(), "agent orchestrator disposed");
        for event in events {
            self.inner.events.publish(event);
        }
    }

    // ---- Background tasks ----

    fn spawn_exit_monitor(&self, session_id: Uuid, process: Arc<ProcessHandle>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let code = process.wait().await;
            if let Some(inner) = weak.upgrade() {
                AgentOrchestrator { inner }.handle_exit(session_id, code).await;
            }
        });
    }

    async fn handle_exit(&self, session_id: Uuid, code: Option<i32>) {
        let status = if code == Some(0) {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        };

        let events = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(tracked) = sessions.get_mut(&session_id) else {
                return;
            };
            if !tracked.finish(status, code, &self.inner.hooks) {
                return;
            }
            let mut events = vec![stopped_event(&tracked.session)];
            if status == SessionStatus::Error {
                events.push(OrchestratorEvent::Error {
                    task_id: tracked.session.task_id.clone(),
                    session_id,
                    message: match code {
                        Some(c) => format!("agent exited with code {c}"),
                        None => "agent terminated without an exit code".to_string(),
                    },
                    timestamp: Utc::now(),
                });
            }
            events
        };

        info!(%session_id, ?code, %status, "agent session exited");
        for event in events {
            self.inner.events.publish(event);
        }
    }

    fn ensure_watchdog(&self) {
        let mut guard = self.inner.watchdog.lock().unwrap_or_else(|e| {
            warn!("watchdog lock was poisoned, recovering");
            e.into_inner()
        });
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let period = self.inner.config.watchdog_interval();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                AgentOrchestrator { inner }.check_sessions().await;
            }
        }));
        debug!(interval = ?period, "agent watchdog started");
    }

    /// Whether the background watchdog loop is running.
    pub fn watchdog_running(&self) -> bool {
        self.inner
            .watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Out-of-range durations saturate at a century.
fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn stopped_event(session: &AgentSession) -> OrchestratorEvent {
    OrchestratorEvent::Stopped {
        task_id: session.task_id.clone(),
        session_id: session.id,
        status: session.status,
        exit_code: session.exit_code,
        timestamp: Utc::now(),
    }
}
