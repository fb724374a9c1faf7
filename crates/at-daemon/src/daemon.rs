use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use at_agents::commands::AgentCommands;
use at_agents::orchestrator::AgentOrchestrator;
use at_agents::qa_runner::QaRunner;
use at_bridge::event_bus::EventBus;
use at_bridge::notifications::{
    Notification, NotificationSink, NotificationType, SharedNotifications,
};
use at_bridge::protocol::{ChannelEvent, ForwardedEvent};
use at_core::config::Config;
use at_harness::health::{HealthRegistry, HealthSettings};
use at_session::launcher::{ProcessLauncher, TokioProcessLauncher};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::tasks::MemoryTaskStore;

/// Health entry pulsed while the orchestrator watchdog keeps sweeping.
pub const ORCHESTRATOR_SERVICE: &str = "agent-orchestrator";

// ---------------------------------------------------------------------------
// ShutdownHandle
// ---------------------------------------------------------------------------

/// Cloneable trigger that ends [`Daemon::run`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        if self.tx.send_replace(true) {
            warn!("shutdown already triggered");
        } else {
            info!("shutdown signal triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Owns every long-running service and the tasks that connect them.
///
/// Orchestrator and QA events are re-published on a single bridge bus as
/// [`ForwardedEvent`]s. A pulse loop feeds the health registry from the
/// orchestrator's watchdog sweeps, so a stalled watchdog surfaces as an
/// unhealthy `agent-orchestrator` service.
pub struct Daemon {
    config: Config,
    health: Arc<HealthRegistry>,
    notifications: SharedNotifications,
    orchestrator: AgentOrchestrator,
    qa: QaRunner,
    commands: AgentCommands,
    tasks: Arc<MemoryTaskStore>,
    bridge: EventBus<ForwardedEvent>,
    shutdown: ShutdownHandle,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    /// Build a daemon that launches real agent processes.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_launcher(config, Arc::new(TokioProcessLauncher::new()))
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        config.validate().context("invalid daemon configuration")?;

        let notifications = SharedNotifications::new(config.notifications.max_notifications);
        let sink = notifications.clone();
        let health = HealthRegistry::with_settings(
            HealthSettings::from(&config.health),
            move |name, missed| {
                warn!(service = name, missed, "service unhealthy");
                sink.on_notification(Notification::new(
                    NotificationType::ServiceUnhealthy,
                    "Service unhealthy",
                    format!("{name} missed {missed} consecutive heartbeats"),
                ));
            },
        );

        let orchestrator = AgentOrchestrator::new(config.agents.clone(), launcher);
        let qa = QaRunner::new(
            config.qa.clone(),
            orchestrator.clone(),
            Arc::new(notifications.clone()),
        );
        let tasks = Arc::new(MemoryTaskStore::new());
        let commands = AgentCommands::new(orchestrator.clone(), tasks.clone());

        Ok(Self {
            config,
            health: Arc::new(health),
            notifications,
            orchestrator,
            qa,
            commands,
            tasks,
            bridge: EventBus::new(),
            shutdown: ShutdownHandle::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    fn background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(|e| {
            warn!("daemon task list lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn commands(&self) -> &AgentCommands {
        &self.commands
    }

    pub fn orchestrator(&self) -> &AgentOrchestrator {
        &self.orchestrator
    }

    pub fn qa(&self) -> &QaRunner {
        &self.qa
    }

    pub fn tasks(&self) -> &Arc<MemoryTaskStore> {
        &self.tasks
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn notifications(&self) -> &SharedNotifications {
        &self.notifications
    }

    /// Receive every orchestrator and QA event as a channel envelope.
    pub fn subscribe(&self) -> flume::Receiver<ForwardedEvent> {
        self.bridge.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register health entries and spawn the forwarding and pulse tasks.
    ///
    /// Calling this again while the daemon is running does nothing.
    pub fn start(&self) {
        let mut background = self.background();
        if !background.is_empty() {
            debug!("daemon already started");
            return;
        }

        let period = self.config.agents.watchdog_interval();
        self.health
            .register(ORCHESTRATOR_SERVICE, period.as_millis() as u64);
        self.health.start();

        background.push(forward(self.orchestrator.subscribe(), self.bridge.clone()));
        background.push(forward(self.qa.subscribe(), self.bridge.clone()));
        background.push(spawn_pulse_loop(
            self.orchestrator.clone(),
            Arc::clone(&self.health),
            period,
        ));

        info!(
            watchdog_secs = period.as_secs(),
            sweep_secs = self.config.health.sweep_interval_secs,
            "daemon services started"
        );
    }

    /// Start, block until the shutdown handle fires, then dispose.
    pub async fn run(&self) -> Result<()> {
        self.start();
        self.shutdown.wait().await;
        info!("shutdown requested, disposing services");
        self.dispose().await;
        Ok(())
    }

    /// Stop background tasks, cancel QA runs and kill every live agent.
    pub async fn dispose(&self) {
        for handle in self.background().drain(..) {
            handle.abort();
        }
        self.qa.dispose().await;
        self.orchestrator.dispose().await;
        self.health.dispose();
        info!("daemon stopped");
    }
}

/// Re-publish every event from `rx` on the bridge bus.
fn forward<E>(rx: flume::Receiver<E>, bridge: EventBus<ForwardedEvent>) -> JoinHandle<()>
where
    E: ChannelEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(event) = rx.recv_async().await {
            match ForwardedEvent::from_event(&event) {
                Ok(envelope) => bridge.publish(envelope),
                Err(e) => warn!(channel = %event.channel(), error = %e, "failed to encode event"),
            }
        }
    })
}

fn spawn_pulse_loop(
    orchestrator: AgentOrchestrator,
    health: Arc<HealthRegistry>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sweep_is_fresh(orchestrator.last_sweep(), period, Utc::now()) {
                health.pulse(ORCHESTRATOR_SERVICE);
            } else {
                debug!("orchestrator watchdog is behind, withholding pulse");
            }
        }
    })
}

/// An orchestrator that has never swept (no session spawned yet) counts as
/// healthy; otherwise the last sweep must be within two watchdog periods.
pub(crate) fn sweep_is_fresh(
    last_sweep: Option<DateTime<Utc>>,
    period: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(at) = last_sweep else {
        return true;
    };
    let limit =
        chrono::Duration::from_std(period * 2).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now - at <= limit
}
