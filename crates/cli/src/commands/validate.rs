//! Validate Command

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use uiverify_harness::Scenario;

use crate::output::{print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ValidateArgs {
    /// Scenario files or directories
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Serialize)]
pub struct StepDisplay {
    pub scenario: String,
    pub phase: String,
    pub index: usize,
    pub action: String,
    pub description: String,
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Phase", "#", "Action", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.scenario.clone(),
            self.phase.clone(),
            self.index.to_string(),
            self.action.clone(),
            self.description.clone(),
        ]
    }
}

fn steps_of(scenario: &Scenario) -> Vec<StepDisplay> {
    scenario
        .all_steps()
        .map(|(phase, step, index)| StepDisplay {
            scenario: scenario.name.clone(),
            phase: format!("{:?}", phase).to_lowercase(),
            index,
            action: step.kind().to_string(),
            description: step.describe(),
        })
        .collect()
}

/// Returns whether every scenario is valid
pub fn execute(args: ValidateArgs, format: OutputFormat) -> Result<bool> {
    let scenarios = super::load_scenarios(&args.files)?;

    let mut rows = Vec::new();
    let mut invalid = 0;
    for scenario in &scenarios {
        match scenario.validate() {
            Ok(()) => rows.extend(steps_of(scenario)),
            Err(e) => {
                invalid += 1;
                print_error(&e.to_string());
            }
        }
    }

    print_list(&rows, format);
    if invalid == 0 {
        print_success(&format!("{} scenario(s) valid", scenarios.len()));
    }
    Ok(invalid == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_listing_covers_all_phases() {
        let scenario = Scenario::from_yaml(
            r#"
name: listing
base_url: http://127.0.0.1:9/
setup:
  - action: navigate
    url: /
steps:
  - action: click
    selector: .hero-points-star
teardown:
  - action: log
    message: bye
"#,
        )
        .unwrap();

        let rows = steps_of(&scenario);
        let phases: Vec<_> = rows.iter().map(|r| r.phase.as_str()).collect();
        assert_eq!(phases, ["setup", "steps", "teardown"]);
        assert_eq!(rows[1].description, "click .hero-points-star");
    }
}
