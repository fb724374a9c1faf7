#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use at_agents::orchestrator::AgentOrchestrator;
use at_core::config::AgentsConfig;
use at_session::launcher::{
    LaunchError, LaunchSpec, ProcessControl, ProcessHandle, ProcessLauncher,
};

/// Records launches and hands out controllable fake processes.
#[derive(Default)]
pub struct MockLauncher {
    pub specs: Mutex<Vec<LaunchSpec>>,
    pub controls: Mutex<Vec<ProcessControl>>,
    /// Written to the log file on launch.
    pub output: Mutex<Option<Vec<u8>>>,
    /// Exit code reported right after launch.
    pub auto_exit: Mutex<Option<i32>>,
    pub fail: Mutex<bool>,
    /// When set, `launch` waits for a message before starting the process.
    pub gate: Mutex<Option<flume::Receiver<()>>>,
    /// Launch calls entered, including ones still waiting on the gate.
    pub entered: Mutex<usize>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_output(output: &str, exit_code: i32) -> Arc<Self> {
        Self::with_raw_output(output.as_bytes(), exit_code)
    }

    pub fn with_raw_output(output: &[u8], exit_code: i32) -> Arc<Self> {
        let launcher = Self::default();
        *launcher.output.lock().unwrap() = Some(output.to_vec());
        *launcher.auto_exit.lock().unwrap() = Some(exit_code);
        Arc::new(launcher)
    }

    pub fn failing() -> Arc<Self> {
        let launcher = Self::default();
        *launcher.fail.lock().unwrap() = true;
        Arc::new(launcher)
    }

    /// Hold every launch until a message arrives on the returned sender.
    pub fn gated() -> (Arc<Self>, flume::Sender<()>) {
        let (tx, rx) = flume::unbounded();
        let launcher = Self::default();
        *launcher.gate.lock().unwrap() = Some(rx);
        (Arc::new(launcher), tx)
    }

    pub fn entered(&self) -> usize {
        *self.entered.lock().unwrap()
    }

    pub fn launch_count(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn spec(&self, idx: usize) -> LaunchSpec {
        self.specs.lock().unwrap()[idx].clone()
    }

    /// Kill requests received by the `idx`-th launched process.
    pub fn kills(&self, idx: usize) -> usize {
        self.controls.lock().unwrap()[idx].pending_kills()
    }

    pub fn total_kills(&self) -> usize {
        self.controls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.pending_kills())
            .sum()
    }

    /// Report an exit for the `idx`-th launched process.
    pub fn exit(&self, idx: usize, code: Option<i32>) {
        self.controls.lock().unwrap()[idx].report_exit(code);
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        *self.entered.lock().unwrap() += 1;
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.recv_async().await;
        }

        if *self.fail.lock().unwrap() {
            return Err(LaunchError::Spawn {
                program: spec.program.clone(),
                reason: "mock failure".into(),
            });
        }

        if let Some(output) = self.output.lock().unwrap().clone() {
            if let Some(parent) = spec.log_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&spec.log_file, output)?;
        }

        let pid = 1000 + self.specs.lock().unwrap().len() as u32;
        let (handle, control) = ProcessHandle::channel(Some(pid));
        if let Some(code) = *self.auto_exit.lock().unwrap() {
            control.report_exit(Some(code));
        }
        self.specs.lock().unwrap().push(spec);
        self.controls.lock().unwrap().push(control);
        Ok(handle)
    }
}

pub fn test_config() -> AgentsConfig {
    AgentsConfig {
        command: "fake-agent".into(),
        args: vec!["-p".into()],
        watchdog_interval_secs: 3600,
        ..AgentsConfig::default()
    }
}

pub fn orchestrator(launcher: Arc<MockLauncher>) -> AgentOrchestrator {
    AgentOrchestrator::new(test_config(), launcher)
}

/// Poll `f` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
