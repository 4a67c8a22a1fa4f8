//! Selector language
//!
//! A selector is a chain of segments separated by ` >> `. Each segment narrows
//! the set produced by the previous one:
//!
//! - `css=<css>` or bare CSS, optionally ending in `:has-text("...")`
//! - `text=foo` (case-insensitive substring) or `text="foo"` (exact)
//! - `has-text="foo"` (keep elements whose text contains `foo`)
//! - `nth=<i>` (pick one element, negative counts from the end)
//!
//! Selectors are parsed eagerly so malformed ones fail at load time, but they
//! are resolved lazily against the live page on every use.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

static HAS_TEXT_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#":has-text\(\s*(?:"([^"]*)"|'([^']*)')\s*\)$"#).expect("static regex is valid")
});

/// One step of selector resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Css { css: String, has_text: Vec<String> },
    Text { text: String, exact: bool },
    HasText { text: String },
    Nth { index: i64 },
}

/// A parsed locator expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    source: String,
    segments: Vec<Segment>,
}

impl Selector {
    pub fn parse(source: &str) -> HarnessResult<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(invalid(source, "selector is empty"));
        }

        let segments = split_chain(source)
            .into_iter()
            .map(|raw| parse_segment(raw, source))
            .collect::<HarnessResult<Vec<_>>>()?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The first match, like Playwright's `.first`.
    pub fn first(&self) -> Self {
        self.nth(0)
    }

    pub fn nth(&self, index: i64) -> Self {
        self.chain(format!("nth={}", index), Segment::Nth { index })
    }

    /// Keep only matches whose text contains `text`.
    pub fn has_text(&self, text: &str) -> Self {
        self.chain(
            format!("has-text=\"{}\"", text),
            Segment::HasText {
                text: text.to_string(),
            },
        )
    }

    /// Resolve `child` inside every match of `self`.
    pub fn locator(&self, child: &Selector) -> Self {
        let mut next = self.clone();
        next.source = format!("{} >> {}", self.source, child.source);
        next.segments.extend(child.segments.iter().cloned());
        next
    }

    /// True when resolution can yield at most one element.
    pub fn is_single(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Nth { .. }))
    }

    fn chain(&self, source: String, segment: Segment) -> Self {
        let mut next = self.clone();
        next.source = format!("{} >> {}", self.source, source);
        next.segments.push(segment);
        next
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Selector {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Selector {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.source
    }
}

fn invalid(selector: &str, reason: impl Into<String>) -> HarnessError {
    HarnessError::InvalidSelector {
        selector: selector.to_string(),
        reason: reason.into(),
    }
}

/// Split on `>>` outside of quotes.
fn split_chain(source: &str) -> Vec<&str> {
    let bytes = source.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' && bytes.get(i + 1) == Some(&b'>') => {
                parts.push(&source[start..i]);
                i += 2;
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&source[start..]);
    parts
}

fn parse_segment(raw: &str, source: &str) -> HarnessResult<Segment> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(invalid(source, "empty segment around '>>'"));
    }

    if let Some(rest) = raw.strip_prefix("text=") {
        return match unquote(rest) {
            Some(text) => Ok(Segment::Text {
                text: text.to_string(),
                exact: true,
            }),
            None if rest.trim().is_empty() => Err(invalid(source, "text= needs a value")),
            None => Ok(Segment::Text {
                text: rest.trim().to_string(),
                exact: false,
            }),
        };
    }

    if let Some(rest) = raw.strip_prefix("has-text=") {
        return unquote(rest)
            .map(|text| Segment::HasText {
                text: text.to_string(),
            })
            .ok_or_else(|| invalid(source, "has-text= needs a quoted value"));
    }

    if let Some(rest) = raw.strip_prefix("nth=") {
        return rest
            .trim()
            .parse::<i64>()
            .map(|index| Segment::Nth { index })
            .map_err(|_| invalid(source, format!("nth= expects an integer, got '{}'", rest)));
    }

    let mut css = raw.strip_prefix("css=").unwrap_or(raw).trim().to_string();
    let mut has_text = Vec::new();
    while let Some(caps) = HAS_TEXT_SUFFIX.captures(&css) {
        let text = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        has_text.insert(0, text);
        let cut = caps.get(0).map(|m| m.start()).unwrap_or(css.len());
        css.truncate(cut);
    }

    if css.contains(":has-text(") {
        return Err(invalid(
            source,
            ":has-text() is only supported at the end of a segment",
        ));
    }
    if css.trim().is_empty() {
        css = "*".to_string();
    }

    Ok(Segment::Css {
        css: css.trim().to_string(),
        has_text,
    })
}

fn unquote(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let first = value.as_bytes()[0];
    let last = value.as_bytes()[value.len() - 1];
    if (first == b'"' || first == b'\'') && first == last {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}
