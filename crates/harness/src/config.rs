//! Harness configuration
//!
//! Loaded from TOML, then overridden by `UIVERIFY_*` environment variables,
//! then by whatever the caller (CLI flags, scenario fields) sets on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactConfig;
use crate::browser::SessionConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::server::ServerConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub session: SessionConfig,
    pub timeouts: Timeouts,
    pub artifacts: ArtifactConfig,
    pub server: ServerConfig,
}

/// Implicit timeouts, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub navigation_ms: u64,
    /// Window for resolving an actionable element before an interaction.
    pub action_ms: u64,
    pub wait_ms: u64,
    pub assert_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation_ms: 30_000,
            action_ms: 5_000,
            wait_ms: 5_000,
            assert_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

/// Per-scenario timeout overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOverrides {
    pub navigation_ms: Option<u64>,
    pub action_ms: Option<u64>,
    pub wait_ms: Option<u64>,
    pub assert_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl TimeoutOverrides {
    pub fn values(&self) -> [Option<u64>; 5] {
        [
            self.navigation_ms,
            self.action_ms,
            self.wait_ms,
            self.assert_ms,
            self.poll_interval_ms,
        ]
    }
}

impl Timeouts {
    pub fn merged(&self, overrides: &TimeoutOverrides) -> Self {
        Self {
            navigation_ms: overrides.navigation_ms.unwrap_or(self.navigation_ms),
            action_ms: overrides.action_ms.unwrap_or(self.action_ms),
            wait_ms: overrides.wait_ms.unwrap_or(self.wait_ms),
            assert_ms: overrides.assert_ms.unwrap_or(self.assert_ms),
            poll_interval_ms: overrides.poll_interval_ms.unwrap_or(self.poll_interval_ms),
        }
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> HarnessResult<Self> {
        toml::from_str(content).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> HarnessResult<String> {
        toml::to_string_pretty(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Apply `UIVERIFY_*` overrides from the process environment
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> HarnessResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("UIVERIFY_HEADLESS") {
            self.session.headless = parse_flag("UIVERIFY_HEADLESS", &value)?;
        }
        if let Some(value) = lookup("UIVERIFY_NO_SANDBOX") {
            self.session.no_sandbox = parse_flag("UIVERIFY_NO_SANDBOX", &value)?;
        }
        if let Some(value) = lookup("UIVERIFY_CHROME").filter(|v| !v.trim().is_empty()) {
            self.session.chrome_executable = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("UIVERIFY_ARTIFACT_DIR").filter(|v| !v.trim().is_empty()) {
            self.artifacts.dir = PathBuf::from(value);
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> HarnessResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(HarnessError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
