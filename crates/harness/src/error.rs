//! Error types for the verification harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Browser failed to launch: {0}")]
    Launch(String),

    #[error("Target server failed to start: {0}")]
    ServerStart(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Could not resolve '{selector}': {reason}")]
    ElementResolution { selector: String, reason: String },

    #[error("Option '{value}' not found in '{selector}' (available: {available:?})")]
    OptionNotFound {
        selector: String,
        value: String,
        available: Vec<String>,
    },

    #[error("Timeout after {timeout_ms} ms waiting for: {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Assertion failed: {message} (expected {expected}, got {actual})")]
    AssertionFailure {
        message: String,
        expected: String,
        actual: String,
    },

    #[error("Page script threw: {0}")]
    Evaluation(String),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Scenario parse error: {0}")]
    ScenarioParse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    /// Stable taxonomy name, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Launch(_) => "LaunchError",
            HarnessError::ServerStart(_) => "ServerStartError",
            HarnessError::Navigation { .. } => "NavigationError",
            HarnessError::ElementResolution { .. } => "ElementResolutionError",
            HarnessError::OptionNotFound { .. } => "ElementResolutionError",
            HarnessError::Timeout { .. } => "TimeoutError",
            HarnessError::AssertionFailure { .. } => "AssertionFailure",
            HarnessError::Evaluation(_) => "EvaluationError",
            HarnessError::InvalidSelector { .. } => "InvalidSelector",
            HarnessError::ScenarioParse(_) | HarnessError::Yaml(_) => "ScenarioParseError",
            HarnessError::Config(_) => "ConfigError",
            HarnessError::Internal(_) => "InternalError",
            HarnessError::Io(_) | HarnessError::Json(_) | HarnessError::Http(_) => "IoError",
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        HarnessError::Timeout {
            what: what.into(),
            timeout_ms,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
