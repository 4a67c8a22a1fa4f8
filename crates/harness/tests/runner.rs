//! Scenario runner lifecycle tests against the scripted fake browser

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use uiverify_harness::artifact::Trigger;
use uiverify_harness::diagnostics::{EVENT_DUMP, FAILURE_SCREENSHOT};
use uiverify_harness::runner::FailurePhase;
use uiverify_harness::server::{PortAllocator, Readiness};
use uiverify_harness::scenario::Phase;
use uiverify_harness::{HarnessConfig, RunStatus, Scenario, ScenarioRunner};

use common::{element, FakeDom, FakeEngine};

const SETTINGS_STATS: &str = r#"
name: settings-stats
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: click
    selector: nav >> text="SETTINGS"
  - action: wait
    selector: h2:has-text("STATS")
    state: visible
  - action: assert
    expect: count
    selector: .dice-select
    count: 3
  - action: screenshot
    path: verification/settings.png
"#;

fn runner(engine: &Arc<FakeEngine>, dir: &Path) -> ScenarioRunner {
    let mut config = HarnessConfig::default();
    config.artifacts.dir = dir.to_path_buf();
    config.timeouts.poll_interval_ms = 10;
    ScenarioRunner::new(engine.clone(), config)
}

fn settings_dom() -> FakeDom {
    FakeDom::default()
        .with(r#"nav >> text="SETTINGS""#, vec![element("button", "SETTINGS")])
        .on_click(
            r#"nav >> text="SETTINGS""#,
            r#"h2:has-text("STATS")"#,
            vec![element("h2", "STATS")],
        )
        .with(
            ".dice-select",
            vec![
                common::select(&["d4", "d6", "d8", "d10", "d12"]),
                common::select(&["d4", "d6", "d8", "d10", "d12"]),
                common::select(&["d4", "d6", "d8", "d10", "d12"]),
            ],
        )
}

fn scenario(yaml: &str) -> Scenario {
    Scenario::from_yaml(yaml).expect("scenario should parse")
}

#[tokio::test]
async fn test_settings_screen_passes_and_writes_screenshot() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(settings_dom()));

    let report = runner(&engine, dir.path()).run(&scenario(SETTINGS_STATS)).await;

    assert!(report.passed(), "{:?}", report.failure);
    assert_eq!(report.steps.len(), 5);
    assert!(report.steps.iter().all(|s| s.error.is_none()));

    let shot = dir.path().join("verification/settings.png");
    assert!(shot.exists(), "screenshot missing at {}", shot.display());
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].trigger, Trigger::Manual);
    assert_eq!(report.artifacts[0].path, shot);

    let page = engine.last_page();
    assert_eq!(page.visited(), ["http://app.test/"]);
    assert_eq!(page.clicks(), [r#"nav >> text="SETTINGS""#]);
    assert_eq!(engine.opens(), 1);
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_injected_state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let mut dom = FakeDom::default();
    dom.autosave = true;
    let engine = Arc::new(FakeEngine::new(dom));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: autosave
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: inject_state
    target: window.vm.characterSheet.hero.health.current
    value: 25
  - action: sleep
    ms: 1000
    reason: autosave debounce
  - action: assert
    expect: script
    script: window.vm.characterSheet.hero.health.current
    equals: 25
  - action: reload
  - action: assert
    expect: script
    script: window.vm.characterSheet.hero.health.current
    equals: 25
"#,
        ))
        .await;

    assert!(report.passed(), "{:?}", report.failure);
    assert_eq!(engine.last_page().reloads(), 1);
    assert!(report.steps[2].duration_ms >= 1000);
}

#[tokio::test]
async fn test_state_lost_on_reload_is_an_assertion_failure() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: no-autosave
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: inject_state
    target: window.vm.characterSheet.hero.health.current
    value: 25
  - action: reload
  - action: assert
    expect: script
    script: window.vm.characterSheet.hero.health.current
    equals: 25
    timeout_ms: 200
"#,
        ))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.kind, "AssertionFailure");
    assert_eq!(failure.step_index, Some(3));
    assert!(failure.error.contains("null"), "{}", failure.error);
}

#[tokio::test]
async fn test_missing_modal_fails_with_one_diagnostic_screenshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut dom = FakeDom::default().with(".issue-box", vec![element("div", "Issue")]);
    dom.console_on_load = vec!["app booted".to_string()];
    let engine = Arc::new(FakeEngine::new(dom));

    let started = Instant::now();
    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: issue-modal
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: click
    selector: .issue-box
  - action: assert
    expect: visible
    selector: .modal-overlay
    message: issue modal should open
    timeout_ms: 300
  - action: log
    message: never reached
"#,
        ))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.phase, FailurePhase::Steps);
    assert_eq!(failure.step_index, Some(2));
    assert_eq!(failure.kind, "AssertionFailure");
    assert!(failure.error.contains("issue modal should open"), "{}", failure.error);
    assert!(failure.error.contains("timed out after 300 ms"), "{}", failure.error);

    // Fail-fast: the log step never ran
    assert_eq!(report.steps.len(), 3);

    let scenario_dir = dir.path().join("issue-modal");
    assert!(scenario_dir.join(FAILURE_SCREENSHOT).exists());
    let events = std::fs::read_to_string(scenario_dir.join(EVENT_DUMP)).unwrap();
    assert!(events.contains("app booted"), "{}", events);
    assert_eq!(engine.last_page().screenshots(), 1);
    assert!(report
        .artifacts
        .iter()
        .all(|a| a.trigger == Trigger::Failure));
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_unmet_wait_step_is_an_assertion_failure() {
    let dir = tempfile::tempdir().unwrap();
    let dom = FakeDom::default().with(".issue-box", vec![element("div", "Issue")]);
    let engine = Arc::new(FakeEngine::new(dom));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: issue-modal-wait
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: click
    selector: .issue-box
  - action: wait
    selector: .modal-overlay
    state: visible
    timeout_ms: 300
"#,
        ))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.kind, "AssertionFailure");
    assert_eq!(failure.step_index, Some(2));
    assert!(failure.error.contains(".modal-overlay"), "{}", failure.error);
    assert!(failure.error.contains("expected visible"), "{}", failure.error);
    assert!(failure.error.contains("300 ms"), "{}", failure.error);
    assert_eq!(engine.last_page().screenshots(), 1);
    assert!(dir.path().join("issue-modal-wait").join(FAILURE_SCREENSHOT).exists());
}

#[tokio::test]
async fn test_failed_assert_is_diagnosed_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: badges
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: assert
    expect: count
    selector: .badge
    count: 4
    timeout_ms: 100
teardown:
  - action: assert
    expect: visible
    selector: .reset-done
    timeout_ms: 50
"#,
        ))
        .await;

    assert_eq!(report.failure.unwrap().kind, "AssertionFailure");
    assert_eq!(engine.last_page().screenshots(), 1);
    let failure_artifacts: Vec<_> = report
        .artifacts
        .iter()
        .filter(|a| a.trigger == Trigger::Failure)
        .collect();
    assert_eq!(failure_artifacts.len(), 2);
}

#[tokio::test]
async fn test_panicking_step_is_internal_error_and_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: panics
base_url: http://app.test/
steps:
  - action: navigate
    url: /
  - action: evaluate
    script: panic!
teardown:
  - action: navigate
    url: /cleanup
"#,
        ))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.kind, "InternalError");
    assert_eq!(failure.step_index, Some(1));
    assert!(failure.error.contains("exploded"), "{}", failure.error);

    let page = engine.last_page();
    assert_eq!(page.visited(), ["http://app.test/", "http://app.test/cleanup"]);
    assert_eq!(page.screenshots(), 1);
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_teardown_failure_does_not_change_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: teardown-fails
base_url: http://app.test/
steps:
  - action: navigate
    url: /
teardown:
  - action: click
    selector: .reset-button
    timeout_ms: 100
  - action: log
    message: still runs
"#,
        ))
        .await;

    assert!(report.passed());
    let teardown: Vec<_> = report
        .steps
        .iter()
        .filter(|s| s.phase == Phase::Teardown)
        .collect();
    assert_eq!(teardown.len(), 2);
    assert!(teardown[0].error.is_some());
    assert!(teardown[1].error.is_none());
    // No diagnostics for teardown problems
    assert_eq!(engine.last_page().screenshots(), 0);
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_setup_failure_skips_main_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut dom = FakeDom::default();
    dom.unreachable = vec!["http://app.test/".to_string()];
    let engine = Arc::new(FakeEngine::new(dom));

    let report = runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: setup-fails
base_url: http://app.test/
setup:
  - action: navigate
    url: /
steps:
  - action: log
    message: main
"#,
        ))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.phase, FailurePhase::Setup);
    assert_eq!(failure.step_index, Some(0));
    assert_eq!(failure.kind, "NavigationError");
    assert!(report.steps.iter().all(|s| s.phase == Phase::Setup));
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_launch_failure_has_no_step_index() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::failing());

    let report = runner(&engine, dir.path()).run(&scenario(SETTINGS_STATS)).await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.phase, FailurePhase::Session);
    assert_eq!(failure.kind, "LaunchError");
    assert_eq!(failure.step_index, None);
    assert!(report.steps.is_empty());
    assert_eq!(engine.opens(), 1);
    assert_eq!(engine.closes(), 0);
}

#[tokio::test]
async fn test_server_start_failure_never_opens_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));
    let missing = dir.path().join("no-such-site");

    let yaml = format!(
        "name: unserved\nserve:\n  root: {}\nsteps:\n  - action: navigate\n    url: /\n",
        missing.display()
    );
    let report = runner(&engine, dir.path()).run(&scenario(&yaml)).await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.phase, FailurePhase::Server);
    assert_eq!(failure.kind, "ServerStartError");
    assert_eq!(failure.step_index, None);
    assert_eq!(engine.opens(), 0);
}

#[tokio::test]
async fn test_invalid_scenario_is_reported_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    let report = runner(&engine, dir.path())
        .run(&scenario("name: empty\nbase_url: http://app.test/\nsteps: []\n"))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.phase, FailurePhase::Validate);
    assert_eq!(failure.kind, "ScenarioParseError");
    assert_eq!(engine.opens(), 0);
}

#[tokio::test]
async fn test_repeated_runs_agree() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(settings_dom()));
    let runner = runner(&engine, dir.path());
    let scenario = scenario(SETTINGS_STATS);

    let first = runner.run(&scenario).await;
    let second = runner.run(&scenario).await;

    assert_eq!(first.status, second.status);
    assert_eq!(first.failure, second.failure);
    assert_ne!(first.run_id, second.run_id);
    // Every run gets a fresh session
    assert_eq!(engine.opens(), 2);
    assert_eq!(engine.closes(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_use_separate_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(settings_dom()));
    let runner = runner(&engine, dir.path());
    let a = scenario(SETTINGS_STATS);
    let mut b = a.clone();
    b.name = "settings-stats-again".to_string();

    let (ra, rb) = tokio::join!(runner.run(&a), runner.run(&b));

    assert!(ra.passed(), "{:?}", ra.failure);
    assert!(rb.passed(), "{:?}", rb.failure);
    assert_eq!(engine.opens(), 2);
    assert_eq!(engine.closes(), 2);
}

#[tokio::test]
async fn test_scenario_session_settings_reach_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));

    runner(&engine, dir.path())
        .run(&scenario(
            r#"
name: mobile
base_url: http://app.test/
viewport:
  width: 390
  height: 844
device_scale_factor: 3.0
mobile: true
steps:
  - action: navigate
    url: /
"#,
        ))
        .await;

    let config = engine.last_config();
    assert_eq!(config.viewport.map(|v| (v.width, v.height)), Some((390, 844)));
    assert_eq!(config.device_scale_factor, 3.0);
    assert!(config.mobile);
}

#[tokio::test]
async fn test_suite_report_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new(settings_dom()));
    let runner = runner(&engine, dir.path());

    let passing = scenario(SETTINGS_STATS);
    let failing = scenario(
        "name: broken\nbase_url: http://app.test/\nsteps:\n  - action: click\n    selector: .missing\n    timeout_ms: 50\n",
    );
    let suite = runner.run_all(&[passing, failing]).await;

    assert_eq!(suite.total, 2);
    assert_eq!(suite.passed, 1);
    assert_eq!(suite.failed, 1);
    assert!(!suite.success());

    let broken = &suite.reports[1];
    assert_eq!(broken.failure.as_ref().unwrap().kind, "ElementResolutionError");

    let path = runner.write_report(broken).unwrap();
    assert_eq!(path, dir.path().join("broken").join("report.json"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["failure"]["step_index"], json!(0));

    let results = dir.path().join("results.json");
    runner.write_results(&suite, &results).unwrap();
    assert!(results.exists());
}

/// Serve a static directory through a real server process
fn serving_runner(engine: &Arc<FakeEngine>, dir: &Path, ports: &PortAllocator) -> ScenarioRunner {
    let mut config = HarnessConfig::default();
    config.artifacts.dir = dir.join("results");
    config.timeouts.poll_interval_ms = 10;
    config.server.readiness = Readiness::Tcp;
    ScenarioRunner::new(engine.clone(), config).with_ports(ports.clone())
}

fn served_port(engine: &FakeEngine) -> u16 {
    let url = engine.last_page().visited()[0].clone();
    url.trim_start_matches("http://127.0.0.1:")
        .split('/')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| panic!("unexpected served url {}", url))
}

#[cfg(unix)]
#[tokio::test]
async fn test_served_app_is_stopped_after_passing_run() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("app");
    std::fs::create_dir_all(&site).unwrap();
    std::fs::write(site.join("index.html"), "<h1>HERO TRACKER</h1>").unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));
    let ports = PortAllocator::new();

    let yaml = format!(
        "name: served\nserve:\n  root: {}\nsteps:\n  - action: navigate\n    url: /\n",
        site.display()
    );
    let report = serving_runner(&engine, dir.path(), &ports)
        .run(&scenario(&yaml))
        .await;

    assert!(report.passed(), "{:?}", report.failure);
    let port = served_port(&engine);
    assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    assert!(!ports.is_leased(port));
    assert_eq!(engine.closes(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_served_app_is_stopped_after_failing_step() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("app");
    std::fs::create_dir_all(&site).unwrap();
    std::fs::write(site.join("index.html"), "<h1>HERO TRACKER</h1>").unwrap();
    let engine = Arc::new(FakeEngine::new(FakeDom::default()));
    let ports = PortAllocator::new();

    let yaml = format!(
        "name: served-broken\nserve:\n  root: {}\nsteps:\n  - action: navigate\n    url: /\n  - action: click\n    selector: .issue-box\n    timeout_ms: 50\n",
        site.display()
    );
    let report = serving_runner(&engine, dir.path(), &ports)
        .run(&scenario(&yaml))
        .await;

    let failure = report.failure.expect("run should fail");
    assert_eq!(failure.kind, "ElementResolutionError");
    let port = served_port(&engine);
    assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    assert!(!ports.is_leased(port));
    assert_eq!(engine.closes(), 1);
}
