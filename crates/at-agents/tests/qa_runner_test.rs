mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use at_agents::orchestrator::AgentOrchestrator;
use at_agents::qa_runner::{QaContext, QaRunner};
use at_bridge::notifications::{NotificationType, SharedNotifications};
use at_bridge::protocol::{ChannelEvent, QaEvent};
use at_core::config::QaConfig;
use at_core::types::{QaMode, QaResult, QaSessionStatus, QaSeverity, SessionStatus};
use common::{eventually, orchestrator, MockLauncher};

const PASSING: &str = r#"QA finished.
```json
{"result":"pass","checksRun":5,"checksPassed":5,"issues":[],"verificationSuite":{"lint":"pass","typecheck":"pass","test":"pass","build":"pass","docs":"pass"},"screenshots":[{"label":"Home","path":"shots/home.png","timestamp":"2026-01-01T00:00:00Z","annotated":false}]}
```
"#;

const FAILING: &str = r#"```json
{"result":"fail","checksRun":5,"checksPassed":3,"issues":[{"severity":"critical","category":"console","description":"TypeError on load"}],"verificationSuite":{"lint":"pass","typecheck":"pass","test":"fail","build":"pass","docs":"fail"},"screenshots":[]}
```"#;

fn fast_config() -> QaConfig {
    QaConfig {
        initial_delay_ms: 10,
        poll_interval_ms: 10,
        max_wait_secs: 5,
        ..QaConfig::default()
    }
}

struct Harness {
    runner: QaRunner,
    orchestrator: AgentOrchestrator,
    launcher: Arc<MockLauncher>,
    notifications: SharedNotifications,
}

fn harness(launcher: Arc<MockLauncher>, config: QaConfig) -> Harness {
    let orchestrator = orchestrator(launcher.clone());
    let notifications = SharedNotifications::new(10);
    let runner = QaRunner::new(config, orchestrator.clone(), Arc::new(notifications.clone()));
    Harness {
        runner,
        orchestrator,
        launcher,
        notifications,
    }
}

fn context(project: &Path) -> QaContext {
    QaContext {
        project_path: project.to_path_buf(),
        task_description: Some("Add dark mode".into()),
        changed_files: vec!["src/theme.rs".into()],
        plan_excerpt: None,
    }
}

// ---------------------------------------------------------------------------
// Successful runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn passing_run_completes_with_report() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::with_output(PASSING, 0), fast_config());
    let events = h.runner.subscribe();

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Completed);
    assert!(session.completed_at.is_some());
    assert!(session.agent_session_id.is_some());
    assert_eq!(session.screenshots, vec!["shots/home.png".to_string()]);
    let report = session.report.clone().expect("report");
    assert_eq!(report.result, QaResult::Pass);
    assert_eq!(report.checks_run, 5);
    assert_eq!(h.runner.get_report_for_task("task-1"), Some(report));

    let spec = h.launcher.spec(0);
    assert!(spec.env.contains(&("QA_MODE".to_string(), "quiet".to_string())));
    let output_dir = project.path().join(".auto-tundra/qa/task-1");
    assert!(spec
        .env
        .contains(&("QA_OUTPUT_DIR".to_string(), output_dir.to_string_lossy().into_owned())));
    assert!(output_dir.is_dir());
    assert!(spec.args.last().unwrap().contains("QUIET QA pass"));
    assert!(spec.args.last().unwrap().contains("- src/theme.rs"));

    let names: Vec<String> = events.drain().map(|e| e.channel()).collect();
    assert_eq!(
        names,
        vec![
            "event:qa.started",
            "event:qa.progress",
            "event:qa.progress",
            "event:qa.completed"
        ]
    );
    assert_eq!(h.notifications.count(), 0);
}

#[tokio::test]
async fn progress_reports_two_of_three_before_spawn() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::with_output(PASSING, 0), fast_config());
    let events = h.runner.subscribe();

    h.runner
        .run_qa_session("task-1", QaMode::Full, context(project.path()))
        .await;

    let first_progress = events
        .drain()
        .find(|e| matches!(e, QaEvent::Progress { .. }))
        .expect("progress event");
    assert!(matches!(first_progress, QaEvent::Progress { current: 2, total: 3, .. }));
    assert!(h.launcher.spec(0).args.last().unwrap().contains("FULL QA pass"));
}

#[tokio::test]
async fn report_after_invalid_utf8_output_is_still_parsed() {
    let project = tempfile::tempdir().expect("tempdir");
    let mut output = b"progress bar \xff\n".to_vec();
    output.extend_from_slice(PASSING.as_bytes());
    let h = harness(MockLauncher::with_raw_output(&output, 0), fast_config());

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Completed);
    let report = session.report.expect("report");
    assert_eq!(report.result, QaResult::Pass);
    assert_eq!(report.checks_passed, 5);
}

#[tokio::test]
async fn failing_report_raises_notification() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::with_output(FAILING, 0), fast_config());

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Completed);
    assert_eq!(session.report.as_ref().unwrap().result, QaResult::Fail);

    let stored = h.notifications.snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].notification_type, NotificationType::QaFailure);
    assert_eq!(stored[0].task_id.as_deref(), Some("task-1"));
    assert!(stored[0].message.contains("1 critical"));
}

#[tokio::test]
async fn unparseable_output_fails_closed() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::with_output("all good, trust me", 0), fast_config());

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Completed);
    let report = session.report.expect("fallback report");
    assert_eq!(report.result, QaResult::Fail);
    assert_eq!(report.checks_run, 0);
    assert_eq!(report.issues[0].severity, QaSeverity::Critical);
    assert_eq!(report.issues[0].category, "parse_error");
    assert_eq!(h.notifications.count(), 1);
}

#[tokio::test]
async fn latest_report_replaces_previous() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::with_output(PASSING, 0);
    let h = harness(launcher.clone(), fast_config());

    h.runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;
    assert_eq!(h.runner.get_report_for_task("task-1").unwrap().result, QaResult::Pass);

    *launcher.output.lock().unwrap() = Some(FAILING.as_bytes().to_vec());
    let second = h
        .runner
        .run_qa_session("task-1", QaMode::Full, context(project.path()))
        .await;

    assert_eq!(h.runner.get_report_for_task("task-1").unwrap().result, QaResult::Fail);
    assert_eq!(h.runner.get_session_by_task_id("task-1").map(|s| s.id), Some(second.id));
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_twice_returns_same_session() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let h = harness(launcher.clone(), fast_config());

    let first = h.runner.start_quiet("task-1", context(project.path()));
    let second = h.runner.start_quiet("task-1", context(project.path()));
    let third = h.runner.start_full("task-1", context(project.path()));
    assert_eq!(first.id, second.id);
    assert_eq!(first.id, third.id);
    assert_eq!(third.mode, QaMode::Quiet);

    let l = launcher.clone();
    assert!(eventually(|| {
        let l = l.clone();
        async move { l.launch_count() == 1 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.launch_count(), 1);

    h.runner.dispose().await;
}

#[tokio::test]
async fn other_tasks_run_independently() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::new(), fast_config());

    let a = h.runner.start_quiet("task-a", context(project.path()));
    let b = h.runner.start_quiet("task-b", context(project.path()));
    assert_ne!(a.id, b.id);

    h.runner.dispose().await;
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_failure_ends_in_error() {
    let project = tempfile::tempdir().expect("tempdir");
    let h = harness(MockLauncher::failing(), fast_config());
    let events = h.runner.subscribe();

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Error);
    assert!(session.completed_at.is_some());
    let report = session.report.expect("fallback report");
    assert_eq!(report.result, QaResult::Fail);
    assert!(report.issues[0].description.contains("mock failure"));
    assert!(events
        .drain()
        .any(|e| matches!(e, QaEvent::Error { .. })));
}

#[tokio::test]
async fn agent_exceeding_max_wait_is_killed() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let config = QaConfig {
        max_wait_secs: 1,
        ..fast_config()
    };
    let h = harness(launcher.clone(), config);

    let session = h
        .runner
        .run_qa_session("task-1", QaMode::Quiet, context(project.path()))
        .await;

    assert_eq!(session.status, QaSessionStatus::Error);
    assert!(session.report.unwrap().issues[0].description.contains("did not finish"));
    assert_eq!(launcher.kills(0), 1);
    let agent = h
        .orchestrator
        .get_session(session.agent_session_id.unwrap())
        .await
        .unwrap();
    assert_eq!(agent.status, SessionStatus::Killed);
}

#[tokio::test]
async fn vanished_agent_session_counts_as_finished() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let h = harness(launcher.clone(), fast_config());

    let started = h.runner.start_quiet("task-1", context(project.path()));
    let l = launcher.clone();
    assert!(eventually(|| {
        let l = l.clone();
        async move { l.launch_count() == 1 }
    })
    .await);

    // Forget every agent session behind the runner's back.
    h.orchestrator.dispose().await;

    let runner = h.runner.clone();
    let id = started.id;
    assert!(eventually(|| {
        let runner = runner.clone();
        async move { runner.get_session(id).is_some_and(|s| !s.is_active()) }
    })
    .await);

    let done = h.runner.get_session(id).unwrap();
    assert_eq!(done.status, QaSessionStatus::Completed);
    assert_eq!(done.report.unwrap().result, QaResult::Fail);
}

// ---------------------------------------------------------------------------
// cancel / dispose
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_kills_agent_and_marks_error() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let h = harness(launcher.clone(), fast_config());

    let session = h.runner.start_quiet("task-1", context(project.path()));
    let runner = h.runner.clone();
    let id = session.id;
    assert!(eventually(|| {
        let runner = runner.clone();
        async move { runner.get_session(id).is_some_and(|s| s.agent_session_id.is_some()) }
    })
    .await);

    h.runner.cancel(id).await;

    let cancelled = h.runner.get_session(id).unwrap();
    assert_eq!(cancelled.status, QaSessionStatus::Error);
    assert!(cancelled.completed_at.is_some());
    assert_eq!(launcher.kills(0), 1);

    // The poll loop notices and leaves the session alone.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runner.get_session(id).unwrap().status, QaSessionStatus::Error);

    // Cancelling again is a no-op.
    h.runner.cancel(id).await;
    assert_eq!(launcher.kills(0), 1);
}

#[tokio::test]
async fn dispose_kills_backing_agents_and_clears_state() {
    let project = tempfile::tempdir().expect("tempdir");
    let launcher = MockLauncher::new();
    let h = harness(launcher.clone(), fast_config());

    let session = h.runner.start_quiet("task-1", context(project.path()));
    let runner = h.runner.clone();
    let id = session.id;
    assert!(eventually(|| {
        let runner = runner.clone();
        async move { runner.get_session(id).is_some_and(|s| s.agent_session_id.is_some()) }
    })
    .await);

    h.runner.dispose().await;

    assert_eq!(launcher.kills(0), 1);
    assert!(h.runner.get_session(id).is_none());
    assert!(h.runner.get_session_by_task_id("task-1").is_none());
}

#[tokio::test]
async fn dispose_during_launch_kills_the_late_agent() {
    let project = tempfile::tempdir().expect("tempdir");
    let (launcher, release) = MockLauncher::gated();
    let h = harness(launcher.clone(), fast_config());

    let session = h.runner.start_quiet("task-1", context(project.path()));
    let waiting = launcher.clone();
    assert!(eventually(|| {
        let waiting = waiting.clone();
        async move { waiting.entered() == 1 }
    })
    .await);

    h.runner.dispose().await;
    release.send(()).unwrap();

    let late = launcher.clone();
    assert!(eventually(|| {
        let late = late.clone();
        async move { late.launch_count() == 1 && late.kills(0) == 1 }
    })
    .await);
    assert!(h.runner.get_session(session.id).is_none());
    let agents = h.orchestrator.list_active_sessions().await;
    assert!(agents.iter().all(|s| s.status == SessionStatus::Killed));
}
