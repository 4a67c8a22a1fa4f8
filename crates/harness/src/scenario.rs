//! Declarative YAML scenarios

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{SessionConfig, Viewport};
use crate::config::{TimeoutOverrides, Timeouts};
use crate::error::{HarnessError, HarnessResult};
use crate::expect::{Check, Expectation};
use crate::page::WaitState;
use crate::selector::Selector;
use crate::server::resolve_root;

static STATE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_$][\w$]*(\.[A-Za-z_$][\w$]*|\[\d+\])*$").expect("static regex is valid")
});

/// A verification scenario, pure data until it is run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Serve a directory locally for the duration of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve: Option<Serve>,

    /// Base for relative URLs when nothing is served
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_scale_factor: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<bool>,

    #[serde(default)]
    pub timeouts: TimeoutOverrides,

    /// Fail-fast steps run before `steps`
    #[serde(default)]
    pub setup: Vec<Step>,

    pub steps: Vec<Step>,

    /// Best-effort steps run after `steps` whatever the outcome
    #[serde(default)]
    pub teardown: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Serve {
    /// Directory to serve; relative to the scenario file when loaded from disk
    pub root: PathBuf,

    /// Fixed port; a free one is leased when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A single step of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL, relative to the served or base URL
    Navigate { url: String },

    Reload,

    Click {
        selector: Selector,
        /// Skip actionability checks; only for deliberately covered targets
        #[serde(default)]
        force: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Fill {
        selector: Selector,
        value: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    SelectOption {
        selector: Selector,
        value: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Run a script in the page; with `arg` the script must be a function
    Evaluate {
        script: String,
        #[serde(default)]
        arg: Option<Value>,
    },

    /// Assign `value` to an in-page state path such as
    /// `window.vm.characterSheet.hero.health.current`
    InjectState { target: String, value: Value },

    /// Wait for `selector` to reach `state`, or for `predicate` to be truthy
    Wait {
        #[serde(default)]
        selector: Option<Selector>,
        #[serde(default)]
        state: Option<WaitState>,
        #[serde(default)]
        predicate: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fixed delay (use sparingly)
    Sleep {
        ms: u64,
        #[serde(default)]
        reason: Option<String>,
    },

    Assert(Expectation),

    Screenshot {
        path: PathBuf,
        #[serde(default)]
        selector: Option<Selector>,
        #[serde(default)]
        full_page: bool,
    },

    /// Log a message (for debugging)
    Log { message: String },
}

/// What a `wait` step waits for
#[derive(Debug, Clone, PartialEq)]
pub enum WaitCondition<'a> {
    Selector(&'a Selector, WaitState),
    Predicate(&'a str),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Reload => "reload",
            Step::Click { .. } => "click",
            Step::Fill { .. } => "fill",
            Step::SelectOption { .. } => "select_option",
            Step::Evaluate { .. } => "evaluate",
            Step::InjectState { .. } => "inject_state",
            Step::Wait { .. } => "wait",
            Step::Sleep { .. } => "sleep",
            Step::Assert(_) => "assert",
            Step::Screenshot { .. } => "screenshot",
            Step::Log { .. } => "log",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Step::Navigate { url } => format!("navigate to {}", url),
            Step::Reload => "reload".to_string(),
            Step::Click { selector, force, .. } => {
                if *force {
                    format!("force-click {}", selector)
                } else {
                    format!("click {}", selector)
                }
            }
            Step::Fill {
                selector, value, ..
            } => format!("fill {} with {:?}", selector, value),
            Step::SelectOption {
                selector, value, ..
            } => format!("select {:?} in {}", value, selector),
            Step::Evaluate { script, .. } => format!("evaluate `{}`", one_line(script)),
            Step::InjectState { target, value } => format!("set {} = {}", target, value),
            Step::Wait { .. } => match self.wait_condition() {
                Ok(WaitCondition::Selector(selector, state)) => {
                    format!("wait for {} to be {}", selector, state.as_str())
                }
                Ok(WaitCondition::Predicate(predicate)) => {
                    format!("wait for `{}`", one_line(predicate))
                }
                Err(_) => "wait (invalid)".to_string(),
            },
            Step::Sleep { ms, reason } => match reason {
                Some(reason) => format!("sleep {} ms ({})", ms, reason),
                None => format!("sleep {} ms", ms),
            },
            Step::Assert(expectation) => format!("expect {}", expectation.check.describe()),
            Step::Screenshot { path, .. } => format!("screenshot {}", path.display()),
            Step::Log { message } => format!("log {:?}", message),
        }
    }

    /// The condition of a `wait` step
    pub fn wait_condition(&self) -> HarnessResult<WaitCondition<'_>> {
        match self {
            Step::Wait {
                selector: Some(selector),
                state,
                predicate: None,
                ..
            } => Ok(WaitCondition::Selector(selector, state.unwrap_or_default())),
            Step::Wait {
                selector: None,
                state: None,
                predicate: Some(predicate),
                ..
            } => Ok(WaitCondition::Predicate(predicate)),
            Step::Wait { .. } => Err(HarnessError::ScenarioParse(
                "wait needs either `selector` (with optional `state`) or `predicate`".to_string(),
            )),
            other => Err(HarnessError::Internal(format!(
                "{} step has no wait condition",
                other.kind()
            ))),
        }
    }

    /// Script assigning an `inject_state` value, called with the value
    pub fn injection_script(target: &str) -> String {
        format!("(value) => {{ {} = value; return {}; }}", target, target)
    }

    fn timeout_ms(&self) -> Option<u64> {
        match self {
            Step::Click { timeout_ms, .. }
            | Step::Fill { timeout_ms, .. }
            | Step::SelectOption { timeout_ms, .. }
            | Step::Wait { timeout_ms, .. } => *timeout_ms,
            Step::Assert(expectation) => expectation.timeout_ms,
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.timeout_ms() == Some(0) {
            return Err("timeout_ms must be greater than zero".to_string());
        }
        match self {
            Step::Navigate { url } if url.trim().is_empty() => Err("url is empty".to_string()),
            Step::Evaluate { script, .. } if script.trim().is_empty() => {
                Err("script is empty".to_string())
            }
            Step::InjectState { target, .. } if !STATE_PATH.is_match(target) => Err(format!(
                "target '{}' is not a property path like window.app.state.value",
                target
            )),
            Step::Wait { .. } => self.wait_condition().map(|_| ()).map_err(|e| e.to_string()),
            Step::Assert(expectation) => match &expectation.check {
                Check::Class { pattern, .. } => Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| format!("invalid class pattern: {}", e)),
                Check::Aligned { tolerance, .. } if *tolerance <= 0.0 => {
                    Err("tolerance must be positive".to_string())
                }
                Check::Script { script, .. } if script.trim().is_empty() => {
                    Err("script is empty".to_string())
                }
                _ => Ok(()),
            },
            Step::Screenshot { path, .. } if path.as_os_str().is_empty() => {
                Err("screenshot path is empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn one_line(script: &str) -> String {
    let line = script.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() > 60 {
        format!("{}...", line.chars().take(57).collect::<String>())
    } else {
        line
    }
}

/// Section of a scenario a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Steps,
    Teardown,
}

impl Scenario {
    /// Parse a scenario from YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| HarnessError::ScenarioParse(e.to_string()))
    }

    /// Parse a scenario from a YAML file. A relative `serve.root` is taken
    /// relative to the file's directory.
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut scenario = Self::from_yaml(&content).map_err(|e| match e {
            HarnessError::ScenarioParse(msg) => {
                HarnessError::ScenarioParse(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        if let Some(serve) = scenario.serve.as_mut() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            serve.root = resolve_root(base, &serve.root);
        }
        Ok(scenario)
    }

    /// Load all scenarios in a directory tree, sorted by path
    pub fn load_all(dir: &Path) -> HarnessResult<Vec<Self>> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios
            .iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Reject scenarios that cannot run. Runs before any browser activity.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::ScenarioParse("scenario name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(HarnessError::ScenarioParse(format!(
                "scenario '{}' has no steps",
                self.name
            )));
        }
        if self.timeouts.values().iter().any(|t| *t == Some(0)) {
            return Err(HarnessError::ScenarioParse(format!(
                "scenario '{}': timeouts must be greater than zero",
                self.name
            )));
        }
        if self.serve.is_some() && self.base_url.is_some() {
            return Err(HarnessError::ScenarioParse(format!(
                "scenario '{}': `serve` and `base_url` are mutually exclusive",
                self.name
            )));
        }
        if let Some(viewport) = self.viewport {
            if viewport.width == 0 || viewport.height == 0 {
                return Err(HarnessError::ScenarioParse(format!(
                    "scenario '{}': viewport must be non-empty",
                    self.name
                )));
            }
        }

        for (phase, step, index) in self.all_steps() {
            step.validate().map_err(|reason| {
                HarnessError::ScenarioParse(format!(
                    "scenario '{}', {:?} step {} ({}): {}",
                    self.name,
                    phase,
                    index,
                    step.kind(),
                    reason
                ))
            })?;
        }
        Ok(())
    }

    /// Every step with its phase and index within that phase
    pub fn all_steps(&self) -> impl Iterator<Item = (Phase, &Step, usize)> {
        let setup = self.setup.iter().enumerate().map(|(i, s)| (Phase::Setup, s, i));
        let steps = self.steps.iter().enumerate().map(|(i, s)| (Phase::Steps, s, i));
        let teardown = self
            .teardown
            .iter()
            .enumerate()
            .map(|(i, s)| (Phase::Teardown, s, i));
        setup.chain(steps).chain(teardown)
    }

    /// Session settings with this scenario's overrides applied
    pub fn session_config(&self, base: &SessionConfig) -> SessionConfig {
        let mut config = base.clone();
        if let Some(viewport) = self.viewport {
            config.viewport = Some(viewport);
        }
        if let Some(factor) = self.device_scale_factor {
            config.device_scale_factor = factor;
        }
        if let Some(mobile) = self.mobile {
            config.mobile = mobile;
            config.has_touch = mobile;
        }
        config
    }

    pub fn effective_timeouts(&self, base: &Timeouts) -> Timeouts {
        base.merged(&self.timeouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SETTINGS: &str = r#"
name: settings-stats
description: Settings page shows the STATS section and three dice selectors
tags: [settings, smoke]
serve:
  root: ../app
viewport: { width: 390, height: 844 }
steps:
  - action: navigate
    url: /
  - action: click
    selector: 'nav >> text="SETTINGS"'
  - action: wait
    selector: 'h2:has-text("STATS")'
    state: visible
    timeout_ms: 5000
  - action: assert
    expect: count
    selector: .dice-select
    count: 3
  - action: screenshot
    path: verification/settings.png
    full_page: true
teardown:
  - action: log
    message: done
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml(SETTINGS).unwrap();
        assert_eq!(scenario.name, "settings-stats");
        assert_eq!(scenario.steps.len(), 5);
        assert_eq!(scenario.teardown.len(), 1);
        assert_eq!(scenario.viewport.map(|v| v.width), Some(390));
        scenario.validate().unwrap();

        match &scenario.steps[2] {
            step @ Step::Wait { .. } => {
                let condition = step.wait_condition().unwrap();
                assert!(matches!(condition, WaitCondition::Selector(_, WaitState::Visible)));
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(matches!(
            &scenario.steps[3],
            Step::Assert(Expectation {
                check: Check::Count { count: 3, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_parse_inject_state_and_reload() {
        let scenario = Scenario::from_yaml(
            r#"
name: autosave
base_url: http://localhost:8080/
steps:
  - action: inject_state
    target: window.vm.characterSheet.hero.health.current
    value: 25
  - action: sleep
    ms: 1000
    reason: autosave debounce
  - action: reload
  - action: assert
    expect: script
    script: window.vm.characterSheet.hero.health.current
    equals: 25
"#,
        )
        .unwrap();
        scenario.validate().unwrap();
        assert_eq!(scenario.steps[2], Step::Reload);
        assert_eq!(scenario.steps[0].kind(), "inject_state");
    }

    #[test_case("name: x\nsteps: []\n", "no steps" ; "empty steps")]
    #[test_case("name: ' '\nsteps:\n  - action: reload\n", "name is empty" ; "blank name")]
    #[test_case("name: x\ntimeouts: { wait_ms: 0 }\nsteps:\n  - action: reload\n", "greater than zero" ; "zero scenario timeout")]
    #[test_case("name: x\nsteps:\n  - action: click\n    selector: a\n    timeout_ms: 0\n", "greater than zero" ; "zero step timeout")]
    #[test_case("name: x\nsteps:\n  - action: wait\n    selector: a\n    predicate: 'true'\n", "either" ; "ambiguous wait")]
    #[test_case("name: x\nsteps:\n  - action: inject_state\n    target: 'alert(1)'\n    value: 1\n", "property path" ; "bad inject target")]
    #[test_case("name: x\nbase_url: http://a/\nserve: { root: . }\nsteps:\n  - action: reload\n", "mutually exclusive" ; "serve and base url")]
    fn test_validation_rejects(yaml: &str, needle: &str) {
        let err = Scenario::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, HarnessError::ScenarioParse(_)));
        assert!(err.to_string().contains(needle), "{}", err);
    }

    #[test]
    fn test_unknown_action_is_a_parse_error() {
        let err = Scenario::from_yaml("name: x\nsteps:\n  - action: hover\n    selector: a\n")
            .unwrap_err();
        assert!(matches!(err, HarnessError::ScenarioParse(_)));
    }

    #[test]
    fn test_invalid_selector_fails_at_load() {
        let err = Scenario::from_yaml(
            "name: x\nsteps:\n  - action: click\n    selector: 'nth=abc'\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("nth=abc"), "{}", err);
    }

    #[test]
    fn test_from_file_resolves_serve_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, SETTINGS).unwrap();

        let scenario = Scenario::from_file(&path).unwrap();
        assert_eq!(scenario.serve.unwrap().root, dir.path().join("../app"));
    }

    #[test]
    fn test_session_overrides() {
        let scenario = Scenario::from_yaml(
            "name: m\nmobile: true\ndevice_scale_factor: 3\nviewport: { width: 412, height: 915 }\nsteps:\n  - action: reload\n",
        )
        .unwrap();
        let config = scenario.session_config(&SessionConfig::default());
        assert!(config.mobile && config.has_touch);
        assert_eq!(config.device_scale_factor, 3.0);
        assert_eq!(config.viewport, Some(Viewport { width: 412, height: 915 }));
    }

    #[test]
    fn test_injection_script() {
        assert_eq!(
            Step::injection_script("window.vm.hero.hp"),
            "(value) => { window.vm.hero.hp = value; return window.vm.hero.hp; }"
        );
    }

    #[test]
    fn test_filter_by_tag() {
        let scenarios = vec![Scenario::from_yaml(SETTINGS).unwrap()];
        assert_eq!(Scenario::filter_by_tag(&scenarios, "smoke").len(), 1);
        assert!(Scenario::filter_by_tag(&scenarios, "dice").is_empty());
    }
}
