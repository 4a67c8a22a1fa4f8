//! Condition engine - polling waits over DOM and page state
//!
//! Waits never subscribe to page events; they poll until the condition
//! holds and give up with a `Timeout` error once the whole deadline has
//! elapsed, however slow individual page calls are.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Timeouts;
use crate::error::{HarnessError, HarnessResult};
use crate::page::{ElementState, Page, WaitState};
use crate::selector::Selector;

/// Result of a single observation in a poll loop
pub enum Poll<T> {
    Ready(T),
    /// Not yet; the string describes what was seen
    Pending(String),
}

/// Poll `observe` every `interval` until it is ready or `timeout` elapses.
///
/// Errors from `observe` abort the loop immediately. On timeout the last
/// pending observation is returned as `Err(Some(..))`; `Err(None)` means not
/// even one observation finished in time.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut observe: F,
) -> HarnessResult<Result<T, Option<String>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<Poll<T>>>,
{
    let mut last = None;
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match observe().await? {
                Poll::Ready(value) => return Ok::<T, HarnessError>(value),
                Poll::Pending(seen) => last = Some(seen),
            }
            tokio::time::sleep(interval).await;
        }
    })
    .await;

    match outcome {
        Ok(Ok(value)) => Ok(Ok(value)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Err(last)),
    }
}

pub struct Waiter {
    page: Arc<dyn Page>,
    timeouts: Timeouts,
}

impl Waiter {
    pub fn new(page: Arc<dyn Page>, timeouts: Timeouts) -> Self {
        Self { page, timeouts }
    }

    fn window(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(Duration::from_millis(self.timeouts.wait_ms))
    }

    /// Block until `selector` reaches `state`
    pub async fn wait_for_selector_state(
        &self,
        selector: &Selector,
        state: WaitState,
        timeout: Option<Duration>,
    ) -> HarnessResult<Vec<ElementState>> {
        let window = self.window(timeout);
        debug!("Waiting up to {:?} for {} to be {}", window, selector, state.as_str());

        let page = &self.page;
        let outcome = poll_until(window, self.timeouts.poll_interval(), || async move {
            let matches = page.query(selector).await?;
            Ok::<_, HarnessError>(if state.is_met(&matches) {
                Poll::Ready(matches)
            } else {
                Poll::Pending(describe_matches(&matches))
            })
        })
        .await?;

        outcome.map_err(|last| {
            HarnessError::timeout(
                format!(
                    "{} to be {} (last seen: {})",
                    selector,
                    state.as_str(),
                    last.unwrap_or_else(|| "nothing".to_string())
                ),
                window.as_millis() as u64,
            )
        })
    }

    /// Block until `predicate`, evaluated in the page, is truthy
    pub async fn wait_for_predicate(
        &self,
        predicate: &str,
        timeout: Option<Duration>,
    ) -> HarnessResult<Value> {
        let window = self.window(timeout);
        debug!("Waiting up to {:?} for predicate {}", window, predicate);

        let page = &self.page;
        let outcome = poll_until(window, self.timeouts.poll_interval(), || async move {
            let value = page.evaluate(predicate, None).await?;
            Ok::<_, HarnessError>(if is_truthy(&value) {
                Poll::Ready(value)
            } else {
                Poll::Pending(value.to_string())
            })
        })
        .await?;

        outcome.map_err(|last| {
            HarnessError::timeout(
                format!(
                    "predicate `{}` (last value: {})",
                    predicate,
                    last.unwrap_or_else(|| "none".to_string())
                ),
                window.as_millis() as u64,
            )
        })
    }
}

/// Fixed delay. Only for application timing that has no observable DOM
/// signal; every use is a potential race.
pub async fn sleep(duration: Duration, reason: Option<&str>) {
    match reason {
        Some(reason) => debug!("Sleeping {:?}: {}", duration, reason),
        None => warn!("Sleeping {:?} without a stated reason", duration),
    }
    tokio::time::sleep(duration).await;
}

/// JavaScript truthiness of a returned value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn describe_matches(matches: &[ElementState]) -> String {
    match matches.first() {
        None => "no match".to_string(),
        Some(first) => format!(
            "{} match(es), first {}",
            matches.len(),
            if first.visible { "visible" } else { "hidden" }
        ),
    }
}
