//! Run Command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;
use uiverify_harness::{
    ChromiumEngine, HarnessConfig, RunReport, Scenario, ScenarioRunner, SuiteReport,
};

use crate::output::{print_error, print_list, print_success, truncate, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Scenario files or directories
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Browser executable
    #[arg(long, env = "UIVERIFY_CHROME")]
    pub chrome: Option<PathBuf>,

    /// Disable the browser sandbox (containers running as root)
    #[arg(long)]
    pub no_sandbox: bool,

    /// Artifact root directory
    #[arg(long, env = "UIVERIFY_ARTIFACT_DIR")]
    pub artifacts: Option<PathBuf>,

    /// Write the suite report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Only run scenarios carrying this tag
    #[arg(long)]
    pub tag: Option<String>,
}

/// One summary row per scenario
#[derive(Serialize)]
pub struct RunDisplay {
    pub scenario: String,
    pub status: String,
    pub steps: String,
    pub elapsed_ms: u64,
    pub failure: String,
    pub artifacts: usize,
}

impl From<&RunReport> for RunDisplay {
    fn from(report: &RunReport) -> Self {
        let failed_steps = report.steps.iter().filter(|s| s.error.is_some()).count();
        Self {
            scenario: report.scenario.clone(),
            status: if report.passed() { "passed" } else { "failed" }.to_string(),
            steps: format!("{}/{}", report.steps.len() - failed_steps, report.steps.len()),
            elapsed_ms: report.elapsed_ms,
            failure: report
                .failure
                .as_ref()
                .map(|f| match f.step_index {
                    Some(index) => format!("{:?} step {}: [{}] {}", f.phase, index, f.kind, f.error),
                    None => format!("[{}] {}", f.kind, f.error),
                })
                .unwrap_or_default(),
            artifacts: report.artifacts.len(),
        }
    }
}

impl TableDisplay for RunDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Status", "Steps", "Time", "Failure", "Artifacts"]
    }

    fn row(&self) -> Vec<String> {
        use colored::Colorize;

        let status = if self.status == "passed" {
            "✓ passed".green().to_string()
        } else {
            "✗ failed".red().to_string()
        };
        vec![
            self.scenario.clone(),
            status,
            self.steps.clone(),
            format!("{} ms", self.elapsed_ms),
            truncate(&self.failure, 80),
            self.artifacts.to_string(),
        ]
    }
}

/// Apply CLI flags on top of file and environment configuration
fn build_config(config_path: &Path, args: &RunArgs) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::load(config_path)?;
    config.apply_env()?;

    if args.headed {
        config.session.headless = false;
    }
    if args.no_sandbox {
        config.session.no_sandbox = true;
    }
    if let Some(chrome) = &args.chrome {
        config.session.chrome_executable = Some(chrome.clone());
    }
    if let Some(dir) = &args.artifacts {
        config.artifacts.dir = dir.clone();
    }
    Ok(config)
}

/// Narrow loaded scenarios to those carrying `tag`
fn select(scenarios: Vec<Scenario>, tag: Option<&str>) -> Vec<Scenario> {
    match tag {
        Some(tag) => Scenario::filter_by_tag(&scenarios, tag)
            .into_iter()
            .cloned()
            .collect(),
        None => scenarios,
    }
}

/// Returns whether every scenario passed
pub async fn execute(args: RunArgs, config_path: &Path, format: OutputFormat) -> Result<bool> {
    let config = build_config(config_path, &args)?;
    let scenarios = select(super::load_scenarios(&args.files)?, args.tag.as_deref());
    if scenarios.is_empty() {
        bail!("no scenarios to run");
    }
    for scenario in &scenarios {
        scenario.validate()?;
    }

    let runner = ScenarioRunner::new(Arc::new(ChromiumEngine::new()), config);
    let suite = runner.run_all(&scenarios).await;

    for report in &suite.reports {
        let path = runner.write_report(report)?;
        info!("Report for '{}' at {}", report.scenario, path.display());
    }
    if let Some(path) = &args.report {
        runner.write_results(&suite, path)?;
    }

    print_summary(&suite, &scenarios, format);
    Ok(suite.success())
}

fn print_summary(suite: &SuiteReport, scenarios: &[Scenario], format: OutputFormat) {
    let rows: Vec<RunDisplay> = suite.reports.iter().map(RunDisplay::from).collect();
    print_list(&rows, format);

    if matches!(format, OutputFormat::Table) {
        if suite.success() {
            print_success(&format!(
                "{} of {} scenario(s) passed in {} ms",
                suite.passed,
                scenarios.len(),
                suite.duration_ms
            ));
        } else {
            print_error(&format!(
                "{} of {} scenario(s) failed",
                suite.failed,
                scenarios.len()
            ));
        }
    }
}
