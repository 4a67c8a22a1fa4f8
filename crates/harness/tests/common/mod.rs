//! Scripted in-memory browser for exercising the harness without Chromium
//!
//! The DOM is a map from selector source text to the elements it matches.
//! Clicks can rewrite that map, and page state read through `evaluate` is a
//! map from expression text to value.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use uiverify_harness::browser::{BrowserEngine, Session, SessionConfig};
use uiverify_harness::page::{BoundingBox, CaptureTarget, ElementState, Page};
use uiverify_harness::{EventLog, HarnessError, HarnessResult, Selector};

pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

pub fn element(tag: &str, text: &str) -> ElementState {
    ElementState {
        tag: tag.to_string(),
        text: text.to_string(),
        visible: true,
        enabled: true,
        bounding_box: Some(BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 100.0,
            height: 40.0,
        }),
        ..Default::default()
    }
}

pub fn hidden(tag: &str, text: &str) -> ElementState {
    ElementState {
        visible: false,
        bounding_box: None,
        ..element(tag, text)
    }
}

pub fn select(options: &[&str]) -> ElementState {
    ElementState {
        value: options.first().map(|o| o.to_string()),
        options: options.iter().map(|o| (o.to_string(), o.to_string())).collect(),
        ..element("select", "")
    }
}

/// Page contents; cloned into every new page
#[derive(Debug, Clone, Default)]
pub struct FakeDom {
    pub elements: HashMap<String, Vec<ElementState>>,
    /// selector clicked -> (selector, new matches)
    pub on_click: HashMap<String, Vec<(String, Vec<ElementState>)>>,
    /// selector -> number of queries before it appears
    pub appear_after: HashMap<String, (usize, Vec<ElementState>)>,
    pub vars: HashMap<String, Value>,
    /// Injected values survive reloads (the app autosaves)
    pub autosave: bool,
    pub unreachable: Vec<String>,
    pub throwing: Vec<String>,
    pub console_on_load: Vec<String>,
    pub query_delay: Option<Duration>,
    pub broken_screenshots: bool,
}

impl FakeDom {
    pub fn with(mut self, selector: &str, matches: Vec<ElementState>) -> Self {
        self.elements.insert(selector.to_string(), matches);
        self
    }

    pub fn on_click(mut self, clicked: &str, selector: &str, matches: Vec<ElementState>) -> Self {
        self.on_click
            .entry(clicked.to_string())
            .or_default()
            .push((selector.to_string(), matches));
        self
    }

    pub fn appear_after(mut self, selector: &str, queries: usize, matches: Vec<ElementState>) -> Self {
        self.appear_after
            .insert(selector.to_string(), (queries, matches));
        self
    }

    pub fn var(mut self, expression: &str, value: Value) -> Self {
        self.vars.insert(expression.to_string(), value);
        self
    }
}

#[derive(Debug, Default)]
struct PageState {
    dom: FakeDom,
    persisted: HashMap<String, Value>,
    visited: Vec<String>,
    clicks: Vec<String>,
    queries: HashMap<String, usize>,
    reloads: usize,
    screenshots: usize,
}

pub struct FakePage {
    template: FakeDom,
    state: Mutex<PageState>,
    log: EventLog,
}

impl FakePage {
    pub fn new(dom: FakeDom, log: EventLog) -> Self {
        Self {
            template: dom.clone(),
            state: Mutex::new(PageState {
                dom,
                ..Default::default()
            }),
            log,
        }
    }

    pub fn visited(&self) -> Vec<String> {
        self.state.lock().visited.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn reloads(&self) -> usize {
        self.state.lock().reloads
    }

    pub fn screenshots(&self) -> usize {
        self.state.lock().screenshots
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .dom
            .elements
            .get(selector)
            .and_then(|m| m.first())
            .and_then(|e| e.value.clone())
    }

    fn load(&self, state: &mut PageState) {
        let mut dom = self.template.clone();
        dom.vars.extend(state.persisted.clone());
        state.dom = dom;
        state.queries.clear();
        for line in &state.dom.console_on_load {
            self.log.console("log", line.clone());
        }
    }

    fn with_element<F>(&self, selector: &Selector, index: usize, f: F) -> HarnessResult<()>
    where
        F: FnOnce(&mut ElementState) -> HarnessResult<()>,
    {
        let mut state = self.state.lock();
        let element = state
            .dom
            .elements
            .get_mut(selector.as_str())
            .and_then(|m| m.get_mut(index))
            .ok_or_else(|| HarnessError::ElementResolution {
                selector: selector.to_string(),
                reason: format!("no element at index {}", index),
            })?;
        f(element)
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str) -> HarnessResult<()> {
        let mut state = self.state.lock();
        if state.dom.unreachable.iter().any(|u| u == url) {
            return Err(HarnessError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_REFUSED".to_string(),
            });
        }
        state.visited.push(url.to_string());
        self.load(&mut state);
        Ok(())
    }

    async fn reload(&self) -> HarnessResult<()> {
        let mut state = self.state.lock();
        state.reloads += 1;
        self.load(&mut state);
        Ok(())
    }

    async fn query(&self, selector: &Selector) -> HarnessResult<Vec<ElementState>> {
        let delay = self.state.lock().dom.query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let key = selector.as_str().to_string();
        let seen = {
            let count = state.queries.entry(key.clone()).or_default();
            *count += 1;
            *count
        };
        if let Some((after, matches)) = state.dom.appear_after.get(&key).cloned() {
            if seen > after {
                state.dom.appear_after.remove(&key);
                state.dom.elements.insert(key.clone(), matches);
            }
        }
        Ok(state.dom.elements.get(&key).cloned().unwrap_or_default())
    }

    async fn computed_style(
        &self,
        selector: &Selector,
        index: usize,
        property: &str,
    ) -> HarnessResult<Option<String>> {
        let state = self.state.lock();
        let element = state
            .dom
            .elements
            .get(selector.as_str())
            .and_then(|m| m.get(index))
            .ok_or_else(|| HarnessError::ElementResolution {
                selector: selector.to_string(),
                reason: "detached".to_string(),
            })?;
        Ok(element.attribute(&format!("style:{}", property)).map(str::to_string))
    }

    async fn click(&self, selector: &Selector, index: usize, _force: bool) -> HarnessResult<()> {
        self.with_element(selector, index, |_| Ok(()))?;
        let mut state = self.state.lock();
        state.clicks.push(selector.to_string());
        if let Some(mutations) = state.dom.on_click.get(selector.as_str()).cloned() {
            for (target, matches) in mutations {
                state.dom.elements.insert(target, matches);
            }
        }
        Ok(())
    }

    async fn fill(&self, selector: &Selector, index: usize, text: &str) -> HarnessResult<()> {
        self.with_element(selector, index, |el| {
            el.value = Some(text.to_string());
            Ok(())
        })
    }

    async fn select_option(
        &self,
        selector: &Selector,
        index: usize,
        value: &str,
    ) -> HarnessResult<()> {
        self.with_element(selector, index, |el| {
            el.value = Some(value.to_string());
            Ok(())
        })
    }

    async fn evaluate(&self, script: &str, arg: Option<&Value>) -> HarnessResult<Value> {
        if script == "panic!" {
            panic!("page script handler exploded");
        }

        let mut state = self.state.lock();
        if state.dom.throwing.iter().any(|s| s == script) {
            return Err(HarnessError::Evaluation(format!(
                "ReferenceError: {} is not defined",
                script
            )));
        }

        if let (Some(target), Some(value)) = (injection_target(script), arg) {
            state.dom.vars.insert(target.clone(), value.clone());
            if state.dom.autosave {
                state.persisted.insert(target, value.clone());
            }
            return Ok(value.clone());
        }

        Ok(state.dom.vars.get(script).cloned().unwrap_or(Value::Null))
    }

    async fn screenshot(&self, _target: &CaptureTarget) -> HarnessResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.screenshots += 1;
        if state.dom.broken_screenshots {
            return Err(HarnessError::Internal("screenshot failed: target crashed".to_string()));
        }
        Ok(FAKE_PNG.to_vec())
    }
}

fn injection_target(script: &str) -> Option<String> {
    script
        .strip_prefix("(value) => { ")
        .and_then(|rest| rest.split(" = value;").next())
        .map(str::to_string)
}

/// Engine handing out fresh fake pages built from one template
pub struct FakeEngine {
    dom: FakeDom,
    fail_launch: bool,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pages: Mutex<Vec<Arc<FakePage>>>,
    configs: Mutex<Vec<SessionConfig>>,
}

impl FakeEngine {
    pub fn new(dom: FakeDom) -> Self {
        Self {
            dom,
            fail_launch: false,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            pages: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(FakeDom::default())
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_page(&self) -> Arc<FakePage> {
        self.pages
            .lock()
            .last()
            .cloned()
            .expect("no page was opened")
    }

    pub fn last_config(&self) -> SessionConfig {
        self.configs
            .lock()
            .last()
            .cloned()
            .expect("no session was opened")
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    async fn open(&self, config: &SessionConfig, log: EventLog) -> HarnessResult<Box<dyn Session>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().push(config.clone());
        if self.fail_launch {
            return Err(HarnessError::Launch("chrome binary not found".to_string()));
        }

        let page = Arc::new(FakePage::new(self.dom.clone(), log));
        self.pages.lock().push(page.clone());
        Ok(Box::new(FakeSession {
            page,
            closes: self.closes.clone(),
        }))
    }
}

struct FakeSession {
    page: Arc<FakePage>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for FakeSession {
    async fn new_page(&mut self) -> HarnessResult<Arc<dyn Page>> {
        Ok(self.page.clone())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
