//! Scenario runner
//!
//! Drives one scenario through `Idle -> Starting -> SessionOpen -> Running
//! -> Passed | Failed -> TornDown`. Whatever happens while running, the
//! session is closed and the served process stopped before `run` returns.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{slug, Artifact, ArtifactKind, ArtifactSink, Trigger};
use crate::browser::{BrowserEngine, Session};
use crate::config::{HarnessConfig, Timeouts};
use crate::diagnostics::Diagnostics;
use crate::driver::{ClickOptions, Driver};
use crate::error::{HarnessError, HarnessResult};
use crate::events::EventLog;
use crate::expect::Asserter;
use crate::page::{CaptureTarget, Page};
use crate::scenario::{Phase, Scenario, Step, WaitCondition};
use crate::server::{PortAllocator, ServerHandle};
use crate::wait::{self, Waiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    SessionOpen,
    Running(Phase, usize),
    Passed,
    Failed,
    TornDown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running(phase, index) => write!(f, "Running({:?} {})", phase, index),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Where a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Validate,
    Server,
    Session,
    Setup,
    Steps,
}

impl From<Phase> for FailurePhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Setup => FailurePhase::Setup,
            // Teardown never fails a run
            Phase::Steps | Phase::Teardown => FailurePhase::Steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub phase: FailurePhase,
    /// Absent when no step had started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// Error taxonomy name, e.g. `AssertionFailure`
    pub kind: String,
    pub error: String,
}

impl Failure {
    fn new(phase: FailurePhase, step_index: Option<usize>, error: &HarnessError) -> Self {
        Self {
            phase,
            step_index,
            kind: error.kind().to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub phase: Phase,
    pub kind: String,
    pub description: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Machine-readable result of one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scenario: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub steps: Vec<StepReport>,
    pub artifacts: Vec<Artifact>,
    pub log: Vec<String>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn to_json(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of running several scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub reports: Vec<RunReport>,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// A step that failed, or the panic that replaced it
struct StepFailure {
    phase: Phase,
    index: usize,
    error: HarnessError,
}

/// Everything a step needs while the session is open
struct RunContext {
    page: Arc<dyn Page>,
    driver: Driver,
    waiter: Waiter,
    asserter: Asserter,
    diagnostics: Arc<Diagnostics>,
    sink: ArtifactSink,
    timeouts: Timeouts,
}

impl RunContext {
    async fn execute(&self, phase: Phase, step: &Step) -> HarnessResult<Option<Artifact>> {
        match step {
            Step::Navigate { url } => self.driver.navigate(url).await?,
            Step::Reload => self.driver.reload().await?,
            Step::Click {
                selector,
                force,
                timeout_ms,
            } => {
                let options = ClickOptions {
                    force: *force,
                    timeout: timeout_ms.map(Duration::from_millis),
                };
                self.driver.click(selector, options).await?
            }
            Step::Fill {
                selector,
                value,
                timeout_ms,
            } => {
                self.driver
                    .fill(selector, value, timeout_ms.map(Duration::from_millis))
                    .await?
            }
            Step::SelectOption {
                selector,
                value,
                timeout_ms,
            } => {
                self.driver
                    .select_option(selector, value, timeout_ms.map(Duration::from_millis))
                    .await?
            }
            Step::Evaluate { script, arg } => {
                let value = self.driver.evaluate(script, arg.as_ref()).await?;
                debug!("evaluate returned {}", value);
            }
            Step::InjectState { target, value } => {
                self.driver
                    .evaluate(&Step::injection_script(target), Some(value))
                    .await?;
            }
            Step::Wait { timeout_ms, .. } => {
                let timeout = timeout_ms.map(Duration::from_millis);
                let condition = step.wait_condition()?;
                let result = match &condition {
                    WaitCondition::Selector(selector, state) => self
                        .waiter
                        .wait_for_selector_state(selector, *state, timeout)
                        .await
                        .map(|_| ()),
                    WaitCondition::Predicate(predicate) => self
                        .waiter
                        .wait_for_predicate(predicate, timeout)
                        .await
                        .map(|_| ()),
                };
                result.map_err(|e| unmet_wait(step, &condition, e))?
            }
            Step::Sleep { ms, reason } => {
                wait::sleep(Duration::from_millis(*ms), reason.as_deref()).await
            }
            // Teardown problems are logged, not diagnosed
            Step::Assert(expectation) if phase == Phase::Teardown => {
                self.asserter.check(expectation).await?
            }
            Step::Assert(expectation) => {
                self.asserter
                    .assert(expectation, &self.diagnostics)
                    .await?
            }
            Step::Screenshot {
                path,
                selector,
                full_page,
            } => {
                let target = match (selector, full_page) {
                    (Some(selector), _) => CaptureTarget::Element(selector.clone()),
                    (None, true) => CaptureTarget::FullPage,
                    (None, false) => CaptureTarget::Viewport,
                };
                let capture = self.page.screenshot(&target);
                let png = match tokio::time::timeout(self.timeouts.navigation(), capture).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(HarnessError::timeout(
                            format!("screenshot {}", path.display()),
                            self.timeouts.navigation_ms,
                        ))
                    }
                };
                let artifact =
                    self.sink
                        .write(path, &png, ArtifactKind::Screenshot, Trigger::Manual)?;
                info!("Screenshot saved to {}", artifact.path.display());
                return Ok(Some(artifact));
            }
            Step::Log { message } => info!("{}", message),
        }
        Ok(None)
    }

    /// Run `steps` in order, stopping at the first failure
    async fn execute_phase(
        &self,
        phase: Phase,
        steps: &[Step],
        reports: &mut Vec<StepReport>,
        artifacts: &mut Vec<Artifact>,
    ) -> Result<(), StepFailure> {
        for (index, step) in steps.iter().enumerate() {
            debug!("{}: {}", RunState::Running(phase, index), step.describe());
            let started = Instant::now();
            let result = self.execute(phase, step).await;
            let mut report = step_report(phase, index, step, started);

            match result {
                Ok(artifact) => {
                    artifacts.extend(artifact);
                    reports.push(report);
                }
                Err(error) => {
                    report.error = Some(error.to_string());
                    reports.push(report);
                    return Err(StepFailure {
                        phase,
                        index,
                        error,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A scenario's wait that never came true is a failed expectation about the
/// page, not a harness timeout.
fn unmet_wait(step: &Step, condition: &WaitCondition<'_>, error: HarnessError) -> HarnessError {
    match error {
        HarnessError::Timeout { .. } => HarnessError::AssertionFailure {
            message: step.describe(),
            expected: match condition {
                WaitCondition::Selector(_, state) => state.as_str().to_string(),
                WaitCondition::Predicate(_) => "truthy".to_string(),
            },
            actual: error.to_string(),
        },
        other => other,
    }
}

fn step_report(phase: Phase, index: usize, step: &Step, started: Instant) -> StepReport {
    StepReport {
        index,
        phase,
        kind: step.kind().to_string(),
        description: step.describe(),
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs scenarios against a browser engine
pub struct ScenarioRunner {
    engine: Arc<dyn BrowserEngine>,
    config: HarnessConfig,
    ports: PortAllocator,
}

impl ScenarioRunner {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: HarnessConfig) -> Self {
        Self {
            engine,
            config,
            ports: PortAllocator::new(),
        }
    }

    /// Share a port allocator with other runners
    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn artifact_sink(&self) -> ArtifactSink {
        ArtifactSink::new(&self.config.artifacts.dir)
    }

    /// Run scenarios one after another
    pub async fn run_all(&self, scenarios: &[Scenario]) -> SuiteReport {
        let start = Instant::now();
        let mut reports = Vec::with_capacity(scenarios.len());

        info!("Running {} scenario(s)...", scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(scenario).await);
        }

        let passed = reports.iter().filter(|r| r.passed()).count();
        let failed = reports.len() - passed;
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Scenario results: {} passed, {} failed ({} ms)",
            passed, failed, duration_ms
        );

        SuiteReport {
            total: reports.len(),
            passed,
            failed,
            duration_ms,
            reports,
        }
    }

    /// Run a single scenario. Never fails: every error ends up in the report.
    pub async fn run(&self, scenario: &Scenario) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            scenario: scenario.name.clone(),
            status: RunStatus::Failed,
            failure: None,
            started_at: Utc::now(),
            elapsed_ms: 0,
            steps: Vec::new(),
            artifacts: Vec::new(),
            log: Vec::new(),
        };
        let mut state = RunState::Idle;
        info!("Scenario '{}' ({}) starting", scenario.name, report.run_id);

        if let Err(e) = scenario.validate() {
            report.failure = Some(Failure::new(FailurePhase::Validate, None, &e));
            return self.finish(report, start, &mut state);
        }

        // Starting
        let mut server = None;
        let mut base_url = scenario.base_url.clone();
        if let Some(serve) = &scenario.serve {
            transition(&mut state, RunState::Starting);
            match self.start_server(&serve.root, serve.port).await {
                Ok(handle) => {
                    base_url = Some(handle.base_url().to_string());
                    server = Some(handle);
                }
                Err(e) => {
                    error!("Scenario '{}': {}", scenario.name, e);
                    report.failure = Some(Failure::new(FailurePhase::Server, None, &e));
                    return self.finish(report, start, &mut state);
                }
            }
        }

        // SessionOpen
        let log = EventLog::new();
        let diagnostics = Arc::new(Diagnostics::new(
            self.artifact_sink().scoped(&scenario.name),
            log.clone(),
            Duration::from_millis(self.config.artifacts.diagnostics_timeout_ms),
        ));
        let session_config = scenario.session_config(&self.config.session);
        let mut session = match self.engine.open(&session_config, log.clone()).await {
            Ok(session) => session,
            Err(e) => {
                error!("Scenario '{}': {}", scenario.name, e);
                report.failure = Some(Failure::new(FailurePhase::Session, None, &e));
                stop_server(&mut server).await;
                return self.finish(report, start, &mut state);
            }
        };
        info!("Browser session open for '{}'", scenario.name);
        transition(&mut state, RunState::SessionOpen);

        let timeouts = scenario.effective_timeouts(&self.config.timeouts);
        let context = self
            .context(session.as_mut(), base_url.as_deref(), timeouts, diagnostics.clone())
            .await;
        let outcome = match context {
            Ok(ctx) => {
                let outcome = self.run_steps(&ctx, scenario, &mut report, &mut state).await;
                if let Err(failure) = &outcome {
                    // No-op when a failed assert step already captured
                    diagnostics.capture(ctx.page.as_ref()).await;
                    report.failure = Some(Failure::new(
                        failure.phase.into(),
                        Some(failure.index),
                        &failure.error,
                    ));
                }
                self.run_teardown(&ctx, scenario, &mut report).await;
                outcome.map_err(|_| ())
            }
            Err(e) => {
                diagnostics.dump_log();
                report.failure = Some(Failure::new(FailurePhase::Session, None, &e));
                Err(())
            }
        };

        // TornDown, whatever happened above
        session.close().await;
        info!("Browser session closed for '{}'", scenario.name);
        stop_server(&mut server).await;

        report.artifacts.extend(diagnostics.artifacts());
        if outcome.is_ok() {
            report.status = RunStatus::Passed;
        }
        report.log = log.lines();
        self.finish(report, start, &mut state)
    }

    async fn start_server(&self, root: &Path, port: Option<u16>) -> HarnessResult<ServerHandle> {
        let lease = match port {
            Some(port) => self.ports.pin(port)?,
            None => self.ports.lease()?,
        };
        ServerHandle::spawn(&self.config.server, root, lease).await
    }

    async fn context(
        &self,
        session: &mut dyn Session,
        base_url: Option<&str>,
        timeouts: Timeouts,
        diagnostics: Arc<Diagnostics>,
    ) -> HarnessResult<RunContext> {
        let page = session.new_page().await?;
        let mut driver = Driver::new(page.clone(), timeouts);
        if let Some(base) = base_url {
            driver = driver.with_base_url(base)?;
        }

        Ok(RunContext {
            waiter: Waiter::new(page.clone(), timeouts),
            asserter: Asserter::new(page.clone(), timeouts),
            diagnostics,
            sink: self.artifact_sink(),
            page,
            driver,
            timeouts,
        })
    }

    /// Setup then main steps, fail-fast, with panics turned into failures
    async fn run_steps(
        &self,
        ctx: &RunContext,
        scenario: &Scenario,
        report: &mut RunReport,
        state: &mut RunState,
    ) -> Result<(), StepFailure> {
        let mut steps = Vec::new();
        let mut artifacts = Vec::new();

        let outcome = AssertUnwindSafe(async {
            ctx.execute_phase(Phase::Setup, &scenario.setup, &mut steps, &mut artifacts)
                .await?;
            ctx.execute_phase(Phase::Steps, &scenario.steps, &mut steps, &mut artifacts)
                .await
        })
        .catch_unwind()
        .await;

        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => {
                // The panicking step is the one after the last recorded
                let (phase, index) = if steps.len() < scenario.setup.len() {
                    (Phase::Setup, steps.len())
                } else {
                    (Phase::Steps, steps.len() - scenario.setup.len())
                };
                let error = HarnessError::Internal(format!(
                    "step panicked: {}",
                    panic_message(payload)
                ));
                error!("Scenario '{}': {}", scenario.name, error);
                Err(StepFailure {
                    phase,
                    index,
                    error,
                })
            }
        };

        report.steps.append(&mut steps);
        report.artifacts.append(&mut artifacts);
        match &outcome {
            Ok(()) => transition(state, RunState::Passed),
            Err(failure) => {
                warn!(
                    "Scenario '{}' failed at {:?} step {}: {}",
                    scenario.name, failure.phase, failure.index, failure.error
                );
                transition(state, RunState::Failed);
            }
        }
        outcome
    }

    /// Best effort: failures are recorded and logged, never change the verdict
    async fn run_teardown(&self, ctx: &RunContext, scenario: &Scenario, report: &mut RunReport) {
        for (index, step) in scenario.teardown.iter().enumerate() {
            let started = Instant::now();
            let result = AssertUnwindSafe(ctx.execute(Phase::Teardown, step)).catch_unwind().await;
            let mut step_report = step_report(Phase::Teardown, index, step, started);

            let error = match result {
                Ok(Ok(artifact)) => {
                    report.artifacts.extend(artifact);
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("step panicked: {}", panic_message(payload))),
            };
            if let Some(error) = &error {
                warn!(
                    "Scenario '{}' teardown step {} failed: {}",
                    scenario.name, index, error
                );
            }
            step_report.error = error;
            report.steps.push(step_report);
        }
    }

    fn finish(&self, mut report: RunReport, start: Instant, state: &mut RunState) -> RunReport {
        if !matches!(state, RunState::Passed | RunState::Failed) {
            transition(
                state,
                if report.passed() {
                    RunState::Passed
                } else {
                    RunState::Failed
                },
            );
        }
        transition(state, RunState::TornDown);

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        match &report.failure {
            None => info!("✓ {} ({} ms)", report.scenario, report.elapsed_ms),
            Some(failure) => error!(
                "✗ {} [{}] {} ({} ms)",
                report.scenario, failure.kind, failure.error, report.elapsed_ms
            ),
        }
        report
    }

    /// Write a run report to `<artifact root>/<scenario slug>/report.json`
    pub fn write_report(&self, report: &RunReport) -> HarnessResult<PathBuf> {
        let path = self
            .config
            .artifacts
            .dir
            .join(slug(&report.scenario))
            .join("report.json");
        write_json(&path, &report.to_json()?)?;
        Ok(path)
    }

    /// Write a suite report to `path`
    pub fn write_results(&self, results: &SuiteReport, path: &Path) -> HarnessResult<()> {
        write_json(path, &serde_json::to_string_pretty(results)?)
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!("{} -> {}", state, next);
    *state = next;
}

async fn stop_server(server: &mut Option<ServerHandle>) {
    if let Some(mut handle) = server.take() {
        handle.shutdown().await;
        info!("Target server on port {} stopped", handle.port());
    }
}

fn write_json(path: &Path, json: &str) -> HarnessResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    info!("Report written to: {}", path.display());
    Ok(())
}
