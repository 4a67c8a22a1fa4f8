//! Page automation interface
//!
//! Everything the harness knows about the application under test goes through
//! the [`Page`] trait. Implementations resolve selectors against the live DOM
//! on every call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;
use crate::selector::Selector;

/// Bounding box in CSS pixels, relative to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

/// Snapshot of one matched element at the time of the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementState {
    pub tag: String,
    /// Inner text with whitespace runs collapsed and trimmed.
    pub text: String,
    pub value: Option<String>,
    pub checked: Option<bool>,
    pub visible: bool,
    pub enabled: bool,
    pub bounding_box: Option<BoundingBox>,
    pub attributes: BTreeMap<String, String>,
    /// `(value, label)` pairs of a `<select>`.
    pub options: Vec<(String, String)>,
}

impl ElementState {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn class(&self) -> &str {
        self.attribute("class").unwrap_or_default()
    }

    /// Actionable for a non-forced interaction.
    pub fn is_actionable(&self) -> bool {
        self.visible && self.enabled
    }

    pub fn has_option(&self, value: &str) -> bool {
        self.options
            .iter()
            .any(|(v, label)| v == value || label == value)
    }
}

/// Observable element states for waits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Attached,
    #[default]
    Visible,
    Hidden,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Attached => "attached",
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Detached => "detached",
        }
    }

    /// Whether a query result satisfies this state.
    ///
    /// `hidden` requires the element to be present: an element that never
    /// appears is neither visible nor hidden.
    pub fn is_met(&self, matches: &[ElementState]) -> bool {
        match self {
            WaitState::Attached => !matches.is_empty(),
            WaitState::Detached => matches.is_empty(),
            WaitState::Visible => matches.first().map(|e| e.visible).unwrap_or(false),
            WaitState::Hidden => matches.first().map(|e| !e.visible).unwrap_or(false),
        }
    }
}

/// What a screenshot covers.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureTarget {
    Viewport,
    FullPage,
    Element(Selector),
}

/// Generic page automation interface.
#[async_trait]
pub trait Page: Send + Sync {
    /// Navigate and wait for the load to commit.
    async fn goto(&self, url: &str) -> HarnessResult<()>;

    async fn reload(&self) -> HarnessResult<()>;

    /// All elements currently matching `selector`, in document order.
    async fn query(&self, selector: &Selector) -> HarnessResult<Vec<ElementState>>;

    async fn computed_style(
        &self,
        selector: &Selector,
        index: usize,
        property: &str,
    ) -> HarnessResult<Option<String>>;

    async fn click(&self, selector: &Selector, index: usize, force: bool) -> HarnessResult<()>;

    async fn fill(&self, selector: &Selector, index: usize, text: &str) -> HarnessResult<()>;

    async fn select_option(&self, selector: &Selector, index: usize, value: &str)
        -> HarnessResult<()>;

    /// Run `script` in the page. With `arg`, `script` must be a function
    /// expression and is called with the argument.
    async fn evaluate(
        &self,
        script: &str,
        arg: Option<&serde_json::Value>,
    ) -> HarnessResult<serde_json::Value>;

    /// PNG bytes of the requested region.
    async fn screenshot(&self, target: &CaptureTarget) -> HarnessResult<Vec<u8>>;
}
