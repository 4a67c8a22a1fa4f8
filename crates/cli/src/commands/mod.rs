//! CLI Commands

pub mod run;
pub mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use uiverify_harness::Scenario;

/// Load scenarios from files and directories, in argument order
pub fn load_scenarios(paths: &[PathBuf]) -> Result<Vec<Scenario>> {
    let mut scenarios = Vec::new();
    for path in paths {
        if path.is_dir() {
            let found = Scenario::load_all(path)
                .with_context(|| format!("loading scenarios from {}", path.display()))?;
            scenarios.extend(found);
        } else {
            let scenario = Scenario::from_file(path)
                .with_context(|| format!("loading scenario {}", path.display()))?;
            scenarios.push(scenario);
        }
    }
    Ok(scenarios)
}
