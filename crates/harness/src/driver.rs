//! Interaction driver - navigation and simulated user actions
//!
//! Every interaction first resolves its selector to exactly one element.
//! Zero matches and non-actionable matches are retried until the action
//! window closes; more than one match fails at once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use tracing::debug;

use crate::config::Timeouts;
use crate::error::{HarnessError, HarnessResult};
use crate::page::Page;
use crate::selector::Selector;

/// Options for [`Driver::click`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ClickOptions {
    /// Skip visibility, enabled and hit-test checks
    pub force: bool,
    /// Overrides the resolution window
    pub timeout: Option<Duration>,
}

enum Action<'a> {
    Click { force: bool },
    Fill(&'a str),
    Select(&'a str),
}

impl Action<'_> {
    fn force(&self) -> bool {
        matches!(self, Action::Click { force: true })
    }
}

/// Outcome of one resolution attempt
enum Attempt {
    Retry(String),
    Fatal(HarnessError),
}

pub struct Driver {
    page: Arc<dyn Page>,
    timeouts: Timeouts,
    base_url: Option<Url>,
}

impl Driver {
    pub fn new(page: Arc<dyn Page>, timeouts: Timeouts) -> Self {
        Self {
            page,
            timeouts,
            base_url: None,
        }
    }

    /// Base for relative navigation URLs
    pub fn with_base_url(mut self, base: &str) -> HarnessResult<Self> {
        let mut url = Url::parse(base).map_err(|e| HarnessError::Navigation {
            url: base.to_string(),
            reason: e.to_string(),
        })?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base_url = Some(url);
        Ok(self)
    }

    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn resolve_url(&self, url: &str) -> HarnessResult<String> {
        if let Ok(absolute) = Url::parse(url) {
            return Ok(absolute.to_string());
        }
        let base = self.base_url.as_ref().ok_or_else(|| HarnessError::Navigation {
            url: url.to_string(),
            reason: "relative URL without a base URL".to_string(),
        })?;
        base.join(url)
            .map(|u| u.to_string())
            .map_err(|e| HarnessError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    /// Navigate and wait for the load to commit
    pub async fn navigate(&self, url: &str) -> HarnessResult<()> {
        let url = self.resolve_url(url)?;
        debug!("Navigating to {}", url);
        match tokio::time::timeout(self.timeouts.navigation(), self.page.goto(&url)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Navigation {
                url,
                reason: format!("not committed within {} ms", self.timeouts.navigation_ms),
            }),
        }
    }

    pub async fn reload(&self) -> HarnessResult<()> {
        match tokio::time::timeout(self.timeouts.navigation(), self.page.reload()).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::Navigation {
                url: "(reload)".to_string(),
                reason: format!("not committed within {} ms", self.timeouts.navigation_ms),
            }),
        }
    }

    pub async fn click(&self, selector: &Selector, options: ClickOptions) -> HarnessResult<()> {
        debug!("click {} (force: {})", selector, options.force);
        self.perform(selector, Action::Click { force: options.force }, options.timeout)
            .await
    }

    /// Replace the value of a text-input-like element
    pub async fn fill(
        &self,
        selector: &Selector,
        text: &str,
        timeout: Option<Duration>,
    ) -> HarnessResult<()> {
        debug!("fill {} with {:?}", selector, text);
        self.perform(selector, Action::Fill(text), timeout).await
    }

    /// Select by option value or label; an unknown option fails immediately
    pub async fn select_option(
        &self,
        selector: &Selector,
        value: &str,
        timeout: Option<Duration>,
    ) -> HarnessResult<()> {
        debug!("select {:?} in {}", value, selector);
        self.perform(selector, Action::Select(value), timeout).await
    }

    /// Run a script in the page and return its JSON result
    pub async fn evaluate(&self, script: &str, arg: Option<&Value>) -> HarnessResult<Value> {
        let window = Duration::from_millis(self.timeouts.action_ms);
        match tokio::time::timeout(window, self.page.evaluate(script, arg)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::timeout(
                "page script to return",
                self.timeouts.action_ms,
            )),
        }
    }

    async fn perform(
        &self,
        selector: &Selector,
        action: Action<'_>,
        timeout: Option<Duration>,
    ) -> HarnessResult<()> {
        let window = timeout.unwrap_or(Duration::from_millis(self.timeouts.action_ms));
        let poll = self.timeouts.poll_interval();
        let mut last_reason = String::from("no element matches");

        let outcome = tokio::time::timeout(window, async {
            loop {
                match self.attempt(selector, &action).await {
                    Ok(()) => return Ok(()),
                    Err(Attempt::Fatal(e)) => return Err(e),
                    Err(Attempt::Retry(reason)) => last_reason = reason,
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(HarnessError::ElementResolution {
                selector: selector.to_string(),
                reason: format!("{} (gave up after {} ms)", last_reason, window.as_millis()),
            }),
        }
    }

    async fn attempt(&self, selector: &Selector, action: &Action<'_>) -> Result<(), Attempt> {
        let matches = self.page.query(selector).await.map_err(Attempt::Fatal)?;
        let element = match matches.as_slice() {
            [] => return Err(Attempt::Retry("no element matches".to_string())),
            [one] => one,
            many => {
                return Err(Attempt::Fatal(HarnessError::ElementResolution {
                    selector: selector.to_string(),
                    reason: format!(
                        "strict mode violation: {} elements match, narrow it with nth= or has-text",
                        many.len()
                    ),
                }))
            }
        };

        if !action.force() {
            if !element.visible {
                return Err(Attempt::Retry("element is not visible".to_string()));
            }
            if !element.enabled {
                return Err(Attempt::Retry("element is disabled".to_string()));
            }
        }

        if let Action::Select(value) = action {
            if element.tag != "select" {
                return Err(Attempt::Fatal(HarnessError::ElementResolution {
                    selector: selector.to_string(),
                    reason: format!("<{}> is not a select", element.tag),
                }));
            }
            if !element.has_option(value) {
                return Err(Attempt::Fatal(HarnessError::OptionNotFound {
                    selector: selector.to_string(),
                    value: value.to_string(),
                    available: element.options.iter().map(|(v, _)| v.clone()).collect(),
                }));
            }
        }

        let result = match action {
            Action::Click { force } => self.page.click(selector, 0, *force).await,
            Action::Fill(text) => self.page.fill(selector, 0, text).await,
            Action::Select(value) => self.page.select_option(selector, 0, value).await,
        };

        match result {
            Ok(()) => Ok(()),
            // Covered or detached between query and action
            Err(HarnessError::ElementResolution { reason, .. }) => Err(Attempt::Retry(reason)),
            Err(e) => Err(Attempt::Fatal(e)),
        }
    }
}
