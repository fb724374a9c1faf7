use std::sync::{Arc, Mutex};
use std::time::Duration;

use at_core::config::HealthConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Public snapshot of one registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub expected_interval_ms: u64,
    /// ISO-8601 timestamp of the last pulse.
    pub last_pulse: String,
    pub missed_count: u32,
    pub status: HealthStatus,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    expected_interval_ms: u64,
    last_pulse: DateTime<Utc>,
    missed_count: u32,
    status: HealthStatus,
    /// Edge-trigger flag: set once the unhealthy callback fired for the
    /// current episode, cleared only by a pulse.
    was_unhealthy: bool,
}

impl ServiceEntry {
    fn new(expected_interval_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            expected_interval_ms,
            last_pulse: now,
            missed_count: 0,
            status: HealthStatus::Healthy,
            was_unhealthy: false,
        }
    }
}

/// Sweep tuning. Defaults: 30s sweep, 1.5x tolerance, 3 misses.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub sweep_interval: Duration,
    pub miss_multiplier: f64,
    pub unhealthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthSettings {
    fn from(cfg: &HealthConfig) -> Self {
        Self {
            sweep_interval: cfg.sweep_interval(),
            miss_multiplier: cfg.miss_multiplier,
            unhealthy_threshold: cfg.unhealthy_threshold,
        }
    }
}

/// Invoked with `(name, missed_count)` once per unhealthy episode.
pub type UnhealthyCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

// ---------------------------------------------------------------------------
// HealthRegistry
// ---------------------------------------------------------------------------

/// Tracks heartbeats from named long-running services.
///
/// Services call [`register`](Self::register) once and then
/// [`pulse`](Self::pulse) on their own cadence. A sweep (every 30s by
/// default, see [`start`](Self::start)) counts a miss for every service
/// whose silence exceeds `1.5 x expected_interval`. At three misses the
/// service turns unhealthy and the callback fires; it will not fire again
/// until the service pulses and then goes silent again.
///
/// Only a pulse resets `missed_count`; the sweep never decrements it.
pub struct HealthRegistry {
    entries: Arc<DashMap<String, ServiceEntry>>,
    settings: HealthSettings,
    on_unhealthy: UnhealthyCallback,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl HealthRegistry {
    pub fn new(on_unhealthy: impl Fn(&str, u32) + Send + Sync + 'static) -> Self {
        Self::with_settings(HealthSettings::default(), on_unhealthy)
    }

    pub fn with_settings(
        settings: HealthSettings,
        on_unhealthy: impl Fn(&str, u32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            settings,
            on_unhealthy: Arc::new(on_unhealthy),
            sweeper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Insert or overwrite `name` as healthy with a fresh pulse.
    pub fn register(&self, name: impl Into<String>, expected_interval_ms: u64) {
        let name = name.into();
        debug!(service = %name, expected_interval_ms, "health service registered");
        self.entries
            .insert(name, ServiceEntry::new(expected_interval_ms, Utc::now()));
    }

    /// Record a heartbeat. Unknown names are ignored.
    pub fn pulse(&self, name: &str) {
        self.pulse_at(name, Utc::now());
    }

    /// [`pulse`](Self::pulse) with an explicit timestamp.
    pub fn pulse_at(&self, name: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            if entry.status == HealthStatus::Unhealthy {
                info!(service = %name, "health service recovered");
            }
            entry.last_pulse = at;
            entry.missed_count = 0;
            entry.status = HealthStatus::Healthy;
            entry.was_unhealthy = false;
        }
    }

    /// Snapshot of every registered service, sorted by name.
    pub fn get_status(&self) -> Vec<ServiceHealth> {
        let mut out: Vec<ServiceHealth> = self
            .entries
            .iter()
            .map(|e| snapshot(e.key(), e.value()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<ServiceHealth> {
        self.entries.get(name).map(|e| snapshot(e.key(), e.value()))
    }

    /// Run one sweep against the current wall clock.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    /// Run one sweep as if the time were `now`.
    ///
    /// Returns the services that entered an unhealthy episode during this
    /// sweep (i.e. those the callback fired for).
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        sweep_entries(&self.entries, &self.settings, &self.on_unhealthy, now)
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// Calling this while a sweep loop is already running is a no-op.
    pub fn start(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|e| {
            warn!("health sweeper lock was poisoned, recovering");
            e.into_inner()
        });
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let entries = Arc::clone(&self.entries);
        let settings = self.settings.clone();
        let callback = Arc::clone(&self.on_unhealthy);
        let period = settings.sweep_interval;

        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; sweeps start one period in.
            interval.tick().await;
            loop {
                interval.tick().await;
                sweep_entries(&entries, &settings, &callback, Utc::now());
            }
        }));
        info!(sweep_interval = ?period, "health sweep started");
    }

    /// Whether the periodic sweep is running.
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep timer and forget every service.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| {
                warn!("health sweeper lock was poisoned, recovering");
                e.into_inner()
            })
            .take()
        {
            handle.abort();
        }
        self.entries.clear();
        debug!("health registry disposed");
    }
}

impl Drop for HealthRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

fn snapshot(name: &str, entry: &ServiceEntry) -> ServiceHealth {
    ServiceHealth {
        name: name.to_string(),
        expected_interval_ms: entry.expected_interval_ms,
        last_pulse: entry.last_pulse.to_rfc3339(),
        missed_count: entry.missed_count,
        status: entry.status,
    }
}

fn sweep_entries(
    entries: &DashMap<String, ServiceEntry>,
    settings: &HealthSettings,
    on_unhealthy: &UnhealthyCallback,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut fired: Vec<(String, u32)> = Vec::new();

    for mut item in entries.iter_mut() {
        let (name, entry) = item.pair_mut();
        let silent_ms = now
            .signed_duration_since(entry.last_pulse)
            .num_milliseconds()
            .max(0) as f64;
        let allowed_ms = settings.miss_multiplier * entry.expected_interval_ms as f64;

        if silent_ms > allowed_ms {
            entry.missed_count = entry.missed_count.saturating_add(1);
        }

        if entry.missed_count >= settings.unhealthy_threshold {
            entry.status = HealthStatus::Unhealthy;
            if !entry.was_unhealthy {
                entry.was_unhealthy = true;
                fired.push((name.clone(), entry.missed_count));
            }
        }
    }

    // Callbacks run after the shard locks are released so they may call
    // back into the registry.
    for (name, missed) in &fired {
        warn!(service = %name, missed_count = missed, "health service unhealthy");
        on_unhealthy(name, *missed);
    }

    fired.into_iter().map(|(name, _)| name).collect()
}
