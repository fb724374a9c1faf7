mod common;

use std::io::Write;
use std::path::Path;

use at_agents::orchestrator::{AgentOrchestrator, OrchestratorError, SpawnRequest};
use at_bridge::protocol::OrchestratorEvent;
use at_core::types::{AgentPhase, SessionStatus};
use chrono::Duration;
use common::{eventually, orchestrator, test_config, MockLauncher};

fn planning(task_id: &str, project: &Path) -> SpawnRequest {
    SpawnRequest::new(
        task_id,
        project,
        "/plan-feature Add dark mode",
        AgentPhase::Planning,
    )
}

fn settings_file(project: &Path) -> std::path::PathBuf {
    project.join(".claude/settings.local.json")
}

fn append(path: &Path, line: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open progress file");
    writeln!(f, "{line}").expect("append");
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_registers_active_session() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.phase, AgentPhase::Planning);
    assert_eq!(session.task_id, "task-1");
    assert_eq!(session.command, "/plan-feature Add dark mode");
    assert_eq!(session.pid, Some(1000));
    assert!(session.progress_file.starts_with(project.path().join(".auto-tundra/agent-sessions")));
    assert!(session.log_file.ends_with(format!("{}/agent.log", session.id)));
    assert!(session.original_settings_content.is_none());

    let spec = launcher.spec(0);
    assert_eq!(spec.program, "fake-agent");
    assert_eq!(spec.args, vec!["-p", "/plan-feature Add dark mode"]);
    assert_eq!(spec.cwd, project.path());
    assert!(spec
        .env
        .iter()
        .any(|(k, v)| k == "AUTO_TUNDRA_TASK_ID" && v == "task-1"));

    assert_eq!(orch.get_session(session.id).await, Some(session.clone()));
    assert_eq!(orch.get_session_by_task_id("task-1").await, Some(session));
    assert!(orch.watchdog_running());
}

#[tokio::test]
async fn spawn_installs_progress_hooks() {
    let project = tempfile::tempdir().expect("tempdir");
    let settings = settings_file(project.path());
    std::fs::create_dir_all(settings.parent().unwrap()).unwrap();
    std::fs::write(&settings, r#"{"model":"opus"}"#).unwrap();

    let orch = orchestrator(MockLauncher::new());
    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");

    assert_eq!(
        session.original_settings_content.as_deref(),
        Some(r#"{"model":"opus"}"#)
    );
    let installed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&settings).unwrap()).unwrap();
    assert_eq!(installed["model"], "opus");
    let hook = installed["hooks"]["PostToolUse"][0]["hooks"][0]["command"]
        .as_str()
        .unwrap();
    assert!(hook.contains(&*session.progress_file.to_string_lossy()));
}

#[tokio::test]
async fn overlapping_sessions_restore_settings_after_both_end() {
    let project = tempfile::tempdir().expect("tempdir");
    let settings = settings_file(project.path());
    std::fs::create_dir_all(settings.parent().unwrap()).unwrap();
    std::fs::write(&settings, r#"{"model":"opus"}"#).unwrap();

    let orch = orchestrator(MockLauncher::new());
    let a = orch
        .spawn(planning("task-a", project.path()))
        .await
        .expect("spawn a");
    let b = orch
        .spawn(planning("task-b", project.path()))
        .await
        .expect("spawn b");
    assert_eq!(
        b.original_settings_content.as_deref(),
        Some(r#"{"model":"opus"}"#)
    );

    orch.kill(a.id).await;
    let during = std::fs::read_to_string(&settings).unwrap();
    assert!(!during.contains(&*a.progress_file.to_string_lossy()));
    assert!(during.contains(&*b.progress_file.to_string_lossy()));

    orch.kill(b.id).await;
    assert_eq!(
        std::fs::read_to_string(&settings).unwrap(),
        r#"{"model":"opus"}"#
    );
}

#[tokio::test]
async fn spawn_in_sub_project() {
    let project = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(project.path().join("apps/web")).unwrap();
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());

    let mut req = planning("task-1", project.path());
    req.sub_project_path = Some("apps/web".into());
    orch.spawn(req).await.expect("spawn");

    assert_eq!(launcher.spec(0).cwd, project.path().join("apps/web"));
    assert!(settings_file(&project.path().join("apps/web")).exists());
}

#[tokio::test]
async fn spawn_failure_rejects_and_restores_settings() {
    let project = tempfile::tempdir().expect("tempdir");
    let settings = settings_file(project.path());
    std::fs::create_dir_all(settings.parent().unwrap()).unwrap();
    std::fs::write(&settings, "{}").unwrap();

    let orch = orchestrator(MockLauncher::failing());
    let err = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect_err("spawn should fail");

    assert!(matches!(err, OrchestratorError::SpawnFailed { ref task_id, .. } if task_id == "task-1"));
    assert_eq!(std::fs::read_to_string(&settings).unwrap(), "{}");
    assert!(orch.list_active_sessions().await.is_empty());
}

// ---------------------------------------------------------------------------
// kill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kill_marks_killed_and_restores_settings() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    assert!(settings_file(project.path()).exists());

    orch.kill(session.id).await;

    let killed = orch.get_session(session.id).await.expect("still tracked");
    assert_eq!(killed.status, SessionStatus::Killed);
    assert_eq!(launcher.kills(0), 1);
    // No settings file existed before the spawn.
    assert!(!settings_file(project.path()).exists());

    let stopped: Vec<OrchestratorEvent> = events.drain().collect();
    assert!(matches!(
        stopped.as_slice(),
        [OrchestratorEvent::Stopped { status: SessionStatus::Killed, .. }]
    ));

    // Terminal states are one-way; a second kill does nothing.
    orch.kill(session.id).await;
    assert_eq!(launcher.kills(0), 1);
    assert!(events.is_empty());
}

#[tokio::test]
async fn kill_unknown_session_is_noop() {
    let orch = orchestrator(MockLauncher::new());
    orch.kill(uuid::Uuid::new_v4()).await;
    assert!(orch.list_active_sessions().await.is_empty());
}

// ---------------------------------------------------------------------------
// exit handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_exit_completes_session() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    launcher.exit(0, Some(0));

    let id = session.id;
    let o = orch.clone();
    assert!(
        eventually(|| {
            let o = o.clone();
            async move { o.get_session(id).await.is_some_and(|s| !s.is_active()) }
        })
        .await
    );

    let done = orch.get_session(id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    let got: Vec<OrchestratorEvent> = events.drain().collect();
    assert_eq!(got.len(), 1);
    assert!(matches!(got[0], OrchestratorEvent::Stopped { exit_code: Some(0), .. }));
}

#[tokio::test]
async fn failing_exit_emits_error() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    launcher.exit(0, Some(2));

    let id = session.id;
    let o = orch.clone();
    assert!(
        eventually(|| {
            let o = o.clone();
            async move { o.get_session(id).await.is_some_and(|s| !s.is_active()) }
        })
        .await
    );

    assert_eq!(orch.get_session(id).await.unwrap().status, SessionStatus::Error);
    let got: Vec<OrchestratorEvent> = events.drain().collect();
    assert_eq!(got.len(), 2);
    assert!(matches!(got[0], OrchestratorEvent::Stopped { status: SessionStatus::Error, .. }));
    assert!(matches!(got[1], OrchestratorEvent::Error { ref message, .. } if message.contains("code 2")));
}

// ---------------------------------------------------------------------------
// queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_includes_finished_sessions_and_latest_wins() {
    let project = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(MockLauncher::new());

    let first = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    orch.kill(first.id).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");

    let all = orch.list_active_sessions().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, first.id);
    assert_eq!(all[0].status, SessionStatus::Killed);

    assert_eq!(
        orch.get_session_by_task_id("task-1").await.map(|s| s.id),
        Some(second.id)
    );
    assert!(orch.get_session_by_task_id("task-2").await.is_none());
}

// ---------------------------------------------------------------------------
// watchdog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_lines_become_events() {
    let project = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(MockLauncher::new());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    append(&session.progress_file, r#"{"type":"heartbeat"}"#);
    append(&session.progress_file, r#"{"type":"progress","message":"drafting","percent":30}"#);
    append(&session.progress_file, "not json");
    append(&session.progress_file, r#"{"type":"plan_ready","plan_path":"docs/plan.md"}"#);

    let now = session.spawned_at + Duration::seconds(10);
    orch.check_sessions_at(now).await;

    let got: Vec<OrchestratorEvent> = events.drain().collect();
    assert_eq!(got.len(), 3);
    assert!(matches!(got[0], OrchestratorEvent::Heartbeat { .. }));
    assert!(matches!(
        got[1],
        OrchestratorEvent::Progress { ref message, percent: Some(30), .. } if message == "drafting"
    ));
    assert!(matches!(
        got[2],
        OrchestratorEvent::PlanReady { ref plan_path, .. } if plan_path.as_deref() == Some("docs/plan.md")
    ));
    assert_eq!(orch.get_session(session.id).await.unwrap().last_heartbeat, now);
    assert_eq!(orch.last_sweep(), Some(now));

    // Lines are consumed once.
    orch.check_sessions_at(now + Duration::seconds(1)).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn watchdog_alert_fires_once_per_silence() {
    let project = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(MockLauncher::new());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    let t0 = session.spawned_at;

    orch.check_sessions_at(t0 + Duration::seconds(60)).await;
    assert!(events.is_empty());

    orch.check_sessions_at(t0 + Duration::seconds(121)).await;
    let got: Vec<OrchestratorEvent> = events.drain().collect();
    assert!(matches!(
        got.as_slice(),
        [OrchestratorEvent::WatchdogAlert { silent_for_secs: 121, .. }]
    ));

    // Advisory only: still active, and no repeat while silent.
    orch.check_sessions_at(t0 + Duration::seconds(300)).await;
    assert!(events.is_empty());
    assert!(orch.get_session(session.id).await.unwrap().is_active());

    // A heartbeat re-arms the alert.
    append(&session.progress_file, r#"{"type":"heartbeat"}"#);
    orch.check_sessions_at(t0 + Duration::seconds(310)).await;
    assert_eq!(events.drain().count(), 1);
    orch.check_sessions_at(t0 + Duration::seconds(500)).await;
    assert!(matches!(
        events.drain().collect::<Vec<_>>().as_slice(),
        [OrchestratorEvent::WatchdogAlert { silent_for_secs: 190, .. }]
    ));
}

#[tokio::test]
async fn log_growth_counts_as_heartbeat() {
    let project = tempfile::tempdir().expect("tempdir");
    let orch = orchestrator(MockLauncher::new());
    let events = orch.subscribe();

    let session = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    std::fs::write(&session.log_file, "thinking...\n").unwrap();

    let t = session.spawned_at + Duration::seconds(200);
    orch.check_sessions_at(t).await;

    assert!(events.is_empty());
    assert_eq!(orch.get_session(session.id).await.unwrap().last_heartbeat, t);
}

#[tokio::test]
async fn finished_sessions_are_pruned_after_retention() {
    let project = tempfile::tempdir().expect("tempdir");
    let mut config = test_config();
    config.session_retention_secs = 60;
    let orch = AgentOrchestrator::new(config, MockLauncher::new());

    let done = orch
        .spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    let running = orch
        .spawn(planning("task-2", project.path()))
        .await
        .expect("spawn");
    orch.kill(done.id).await;

    let now = chrono::Utc::now();
    orch.check_sessions_at(now + Duration::seconds(30)).await;
    assert!(orch.get_session(done.id).await.is_some());

    orch.check_sessions_at(now + Duration::seconds(120)).await;
    assert!(orch.get_session(done.id).await.is_none());
    assert!(orch.get_session(running.id).await.is_some());
}

// ---------------------------------------------------------------------------
// dispose
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispose_kills_everything() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let orch = orchestrator(launcher.clone());

    orch.spawn(planning("task-1", project.path()))
        .await
        .expect("spawn");
    orch.spawn(planning("task-2", project.path()))
        .await
        .expect("spawn");
    assert!(orch.watchdog_running());

    orch.dispose().await;

    assert_eq!(launcher.total_kills(), 2);
    assert!(orch.list_active_sessions().await.is_empty());
    assert!(!orch.watchdog_running());
}
