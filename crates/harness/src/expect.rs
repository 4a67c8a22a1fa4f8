//! Expectations and the asserter
//!
//! An expectation is re-observed until it holds or its timeout elapses,
//! the same way a wait is. Only the final verdict is an assertion failure.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Timeouts;
use crate::diagnostics::Diagnostics;
use crate::error::{HarnessError, HarnessResult};
use crate::page::{BoundingBox, ElementState, Page};
use crate::selector::Selector;
use crate::wait::{poll_until, Poll};

fn default_true() -> bool {
    true
}

fn default_tolerance() -> f64 {
    2.0
}

/// Bounding-box edge compared by [`Check::Aligned`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Left,
    Right,
    Top,
    Bottom,
}

impl Edge {
    fn of(&self, bbox: &BoundingBox) -> f64 {
        match self {
            Edge::Left => bbox.x,
            Edge::Right => bbox.right(),
            Edge::Top => bbox.y,
            Edge::Bottom => bbox.bottom(),
        }
    }
}

/// What is being checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expect", rename_all = "snake_case")]
pub enum Check {
    /// Exact text of the first match, whitespace-normalized
    Text { selector: Selector, text: String },
    ContainsText { selector: Selector, text: String },
    Value { selector: Selector, value: String },
    Attribute {
        selector: Selector,
        name: String,
        value: String,
        #[serde(default)]
        contains: bool,
    },
    /// Regular expression over the `class` attribute
    Class { selector: Selector, pattern: String },
    Style {
        selector: Selector,
        property: String,
        value: String,
    },
    Count { selector: Selector, count: usize },
    Visible { selector: Selector },
    /// No match, or the first match is not visible
    NotVisible { selector: Selector },
    Checked {
        selector: Selector,
        #[serde(default = "default_true")]
        checked: bool,
    },
    /// `edge` of `selector` lies within `tolerance` px of the same edge of `reference`
    Aligned {
        selector: Selector,
        reference: Selector,
        edge: Edge,
        #[serde(default = "default_tolerance")]
        tolerance: f64,
    },
    Size {
        selector: Selector,
        #[serde(default)]
        min_width: Option<f64>,
        #[serde(default)]
        max_width: Option<f64>,
        #[serde(default)]
        min_height: Option<f64>,
        #[serde(default)]
        max_height: Option<f64>,
    },
    /// A page-evaluated value equals `equals`
    Script { script: String, equals: Value },
}

impl Check {
    /// Expected side of a failure report
    pub fn expected(&self) -> String {
        match self {
            Check::Text { text, .. } => format!("{:?}", normalize(text)),
            Check::ContainsText { text, .. } => format!("text containing {:?}", normalize(text)),
            Check::Value { value, .. } => format!("{:?}", value),
            Check::Attribute {
                name,
                value,
                contains,
                ..
            } => {
                if *contains {
                    format!("{} containing {:?}", name, value)
                } else {
                    format!("{}={:?}", name, value)
                }
            }
            Check::Class { pattern, .. } => format!("class matching /{}/", pattern),
            Check::Style { property, value, .. } => format!("{}: {}", property, value),
            Check::Count { count, .. } => count.to_string(),
            Check::Visible { .. } => "visible".to_string(),
            Check::NotVisible { .. } => "not visible".to_string(),
            Check::Checked { checked, .. } => format!("checked={}", checked),
            Check::Aligned { edge, tolerance, .. } => {
                format!("{:?} edges less than {} px apart", edge, tolerance)
            }
            Check::Size {
                min_width,
                max_width,
                min_height,
                max_height,
                ..
            } => format!(
                "width in [{}, {}], height in [{}, {}]",
                bound(min_width),
                bound(max_width),
                bound(min_height),
                bound(max_height)
            ),
            Check::Script { equals, .. } => equals.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Check::Text { selector, text } => format!("{} has text {:?}", selector, text),
            Check::ContainsText { selector, text } => format!("{} contains {:?}", selector, text),
            Check::Value { selector, value } => format!("{} has value {:?}", selector, value),
            Check::Attribute {
                selector,
                name,
                value,
                contains,
            } => format!(
                "{} [{}] {} {:?}",
                selector,
                name,
                if *contains { "contains" } else { "=" },
                value
            ),
            Check::Class { selector, pattern } => format!("{} class matches /{}/", selector, pattern),
            Check::Style {
                selector,
                property,
                value,
            } => format!("{} style {} = {:?}", selector, property, value),
            Check::Count { selector, count } => format!("{} matches {} element(s)", selector, count),
            Check::Visible { selector } => format!("{} is visible", selector),
            Check::NotVisible { selector } => format!("{} is not visible", selector),
            Check::Checked { selector, checked } => {
                format!("{} is {}", selector, if *checked { "checked" } else { "unchecked" })
            }
            Check::Aligned {
                selector,
                reference,
                edge,
                ..
            } => format!("{} aligned {:?} with {}", selector, edge, reference),
            Check::Size { selector, .. } => format!("{} size within bounds", selector),
            Check::Script { script, equals } => format!("`{}` == {}", script, equals),
        }
    }
}

/// A check plus its failure message and timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(flatten)]
    pub check: Check,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Expectation {
    pub fn new(check: Check) -> Self {
        Self {
            check,
            message: None,
            timeout_ms: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// One observation of an expectation
struct Observed {
    holds: bool,
    actual: String,
}

impl Observed {
    fn new(holds: bool, actual: impl ToString) -> Self {
        Self {
            holds,
            actual: actual.to_string(),
        }
    }
}

pub struct Asserter {
    page: Arc<dyn Page>,
    timeouts: Timeouts,
}

impl Asserter {
    pub fn new(page: Arc<dyn Page>, timeouts: Timeouts) -> Self {
        Self { page, timeouts }
    }

    /// Evaluate without capturing diagnostics
    pub async fn check(&self, expectation: &Expectation) -> HarnessResult<()> {
        let window = Duration::from_millis(expectation.timeout_ms.unwrap_or(self.timeouts.assert_ms));
        let check = &expectation.check;
        debug!("Expecting {} (within {:?})", check.describe(), window);

        let outcome = poll_until(window, self.timeouts.poll_interval(), || {
            let asserter = self;
            async move { asserter.observe(check).await }
        })
        .await?;

        match outcome {
            Ok(()) => Ok(()),
            Err(last) => Err(HarnessError::AssertionFailure {
                message: expectation
                    .message
                    .clone()
                    .unwrap_or_else(|| check.describe()),
                expected: check.expected(),
                actual: format!(
                    "{} (timed out after {} ms)",
                    last.unwrap_or_else(|| "no observation completed".to_string()),
                    window.as_millis()
                ),
            }),
        }
    }

    /// Evaluate; on failure capture diagnostics before returning the error
    pub async fn assert(
        &self,
        expectation: &Expectation,
        diagnostics: &Diagnostics,
    ) -> HarnessResult<()> {
        match self.check(expectation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                diagnostics.capture(self.page.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn observe(&self, check: &Check) -> HarnessResult<Poll<()>> {
        let observed = self.observe_once(check).await?;
        Ok(if observed.holds {
            Poll::Ready(())
        } else {
            Poll::Pending(observed.actual)
        })
    }

    async fn first(&self, selector: &Selector) -> HarnessResult<Option<ElementState>> {
        Ok(self.page.query(selector).await?.into_iter().next())
    }

    async fn observe_once(&self, check: &Check) -> HarnessResult<Observed> {
        const MISSING: &str = "no matching element";

        let observed = match check {
            Check::Text { selector, text } => match self.first(selector).await? {
                Some(el) => Observed::new(el.text == normalize(text), format!("{:?}", el.text)),
                None => Observed::new(false, MISSING),
            },
            Check::ContainsText { selector, text } => match self.first(selector).await? {
                Some(el) => Observed::new(el.text.contains(&normalize(text)), format!("{:?}", el.text)),
                None => Observed::new(false, MISSING),
            },
            Check::Value { selector, value } => match self.first(selector).await? {
                Some(el) => Observed::new(
                    el.value.as_deref() == Some(value.as_str()),
                    format!("{:?}", el.value.unwrap_or_default()),
                ),
                None => Observed::new(false, MISSING),
            },
            Check::Attribute {
                selector,
                name,
                value,
                contains,
            } => match self.first(selector).await? {
                Some(el) => {
                    let actual = el.attribute(name);
                    let holds = match actual {
                        Some(a) if *contains => a.contains(value.as_str()),
                        Some(a) => a == value,
                        None => false,
                    };
                    Observed::new(holds, format!("{}={:?}", name, actual.unwrap_or_default()))
                }
                None => Observed::new(false, MISSING),
            },
            Check::Class { selector, pattern } => {
                let re = Regex::new(pattern).map_err(|e| HarnessError::AssertionFailure {
                    message: format!("invalid class pattern /{}/", pattern),
                    expected: "a valid regular expression".to_string(),
                    actual: e.to_string(),
                })?;
                match self.first(selector).await? {
                    Some(el) => Observed::new(re.is_match(el.class()), format!("class {:?}", el.class())),
                    None => Observed::new(false, MISSING),
                }
            }
            Check::Style {
                selector,
                property,
                value,
            } => {
                if self.first(selector).await?.is_none() {
                    Observed::new(false, MISSING)
                } else {
                    match self.page.computed_style(selector, 0, property).await {
                        Ok(actual) => Observed::new(
                            actual.as_deref().map(str::trim) == Some(value.trim()),
                            format!("{}: {}", property, actual.unwrap_or_default()),
                        ),
                        // Detached between the query and the style lookup
                        Err(HarnessError::ElementResolution { reason, .. }) => {
                            Observed::new(false, reason)
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Check::Count { selector, count } => {
                let matches = self.page.query(selector).await?;
                Observed::new(matches.len() == *count, matches.len())
            }
            Check::Visible { selector } => match self.first(selector).await? {
                Some(el) => Observed::new(el.visible, visibility(&el)),
                None => Observed::new(false, MISSING),
            },
            Check::NotVisible { selector } => match self.first(selector).await? {
                Some(el) => Observed::new(!el.visible, visibility(&el)),
                None => Observed::new(true, MISSING),
            },
            Check::Checked { selector, checked } => match self.first(selector).await? {
                Some(el) => Observed::new(
                    el.checked == Some(*checked),
                    match el.checked {
                        Some(c) => format!("checked={}", c),
                        None => format!("<{}> is not checkable", el.tag),
                    },
                ),
                None => Observed::new(false, MISSING),
            },
            Check::Aligned {
                selector,
                reference,
                edge,
                tolerance,
            } => {
                let target = self.first(selector).await?.and_then(|e| e.bounding_box);
                let base = self.first(reference).await?.and_then(|e| e.bounding_box);
                match (target, base) {
                    (Some(target), Some(base)) => {
                        let diff = (edge.of(&target) - edge.of(&base)).abs();
                        Observed::new(diff < *tolerance, format!("{:.1} px apart", diff))
                    }
                    _ => Observed::new(false, "missing bounding box"),
                }
            }
            Check::Size {
                selector,
                min_width,
                max_width,
                min_height,
                max_height,
            } => match self.first(selector).await?.and_then(|e| e.bounding_box) {
                Some(b) => Observed::new(
                    within(b.width, *min_width, *max_width) && within(b.height, *min_height, *max_height),
                    format!("{}x{}", b.width, b.height),
                ),
                None => Observed::new(false, "missing bounding box"),
            },
            Check::Script { script, equals } => {
                let value = self.page.evaluate(script, None).await?;
                Observed::new(json_eq(&value, equals), value)
            }
        };

        Ok(observed)
    }
}

fn visibility(el: &ElementState) -> &'static str {
    if el.visible {
        "visible"
    } else {
        "hidden"
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn within(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

fn bound(value: &Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// JSON equality that treats `25` and `25.0` as the same number
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |other| json_eq(v, other)))
        }
        _ => a == b,
    }
}
