//! Browser session management
//!
//! A [`BrowserEngine`] opens [`Session`]s; a session hands out [`Page`]s.
//! The Chromium engine launches one browser process per session with its
//! own throwaway profile directory, and forwards console output, uncaught
//! exceptions and JavaScript dialogs into the session's [`EventLog`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    EventConsoleApiCalled, EventExceptionThrown, RemoteObject,
};
use chromiumoxide::handler::viewport::Viewport as EmulatedViewport;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::CdpPage;
use crate::error::{HarnessError, HarnessResult};
use crate::events::EventLog;
use crate::page::Page;

/// Viewport size in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Browser session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub headless: bool,

    /// `None` keeps the engine's default window size
    pub viewport: Option<Viewport>,

    pub device_scale_factor: f64,

    /// Emulate a mobile device (meta viewport, touch-sized layout)
    pub mobile: bool,

    pub has_touch: bool,

    /// Browser binary; located on the system when unset
    pub chrome_executable: Option<PathBuf>,

    /// Required when running as root inside containers
    pub no_sandbox: bool,

    pub launch_timeout_ms: u64,

    /// Upper bound for a single DevTools request
    pub request_timeout_ms: u64,

    /// Accept `alert`/`confirm`/`prompt` dialogs as soon as they open
    pub accept_dialogs: bool,

    /// Extra command line switches for the browser process
    pub args: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: None,
            device_scale_factor: 1.0,
            mobile: false,
            has_touch: false,
            chrome_executable: None,
            no_sandbox: false,
            launch_timeout_ms: 20_000,
            request_timeout_ms: 30_000,
            accept_dialogs: true,
            args: Vec::new(),
        }
    }
}

/// Starts browser sessions
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Launch a fresh, isolated session. Console and page errors from every
    /// page of the session are appended to `log` until the session closes.
    async fn open(&self, config: &SessionConfig, log: EventLog) -> HarnessResult<Box<dyn Session>>;
}

/// A live browser with an isolated browsing context
#[async_trait]
pub trait Session: Send {
    async fn new_page(&mut self) -> HarnessResult<Arc<dyn Page>>;

    /// Release the browser. Safe to call more than once.
    async fn close(&mut self);
}

/// Chromium over the DevTools protocol
#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine;

impl ChromiumEngine {
    pub fn new() -> Self {
        Self
    }

    fn browser_config(config: &SessionConfig, profile: &TempDir) -> HarnessResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .launch_timeout(Duration::from_millis(config.launch_timeout_ms))
            .request_timeout(Duration::from_millis(config.request_timeout_ms));

        if let Some(viewport) = config.viewport {
            builder = builder
                .window_size(viewport.width, viewport.height)
                .viewport(EmulatedViewport {
                    width: viewport.width,
                    height: viewport.height,
                    device_scale_factor: Some(config.device_scale_factor),
                    emulating_mobile: config.mobile,
                    is_landscape: viewport.width > viewport.height,
                    has_touch: config.has_touch,
                });
        }
        if !config.headless {
            builder = builder.with_head();
        }
        if config.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        for arg in &config.args {
            builder = builder.arg(arg.as_str());
        }

        builder.build().map_err(HarnessError::Launch)
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn open(&self, config: &SessionConfig, log: EventLog) -> HarnessResult<Box<dyn Session>> {
        let profile = tempfile::Builder::new()
            .prefix("uiverify-profile-")
            .tempdir()
            .map_err(|e| HarnessError::Launch(format!("cannot create profile dir: {}", e)))?;
        let browser_config = Self::browser_config(config, &profile)?;

        info!(
            "Launching Chromium (headless: {}, viewport: {:?})",
            config.headless, config.viewport
        );
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| HarnessError::Launch(e.to_string()))?;

        // The handler drives the websocket; it must be polled for the
        // browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("DevTools handler error: {}", e);
                }
            }
        });

        Ok(Box::new(ChromiumSession {
            browser: Some(browser),
            handler_task: Some(handler_task),
            pumps: Vec::new(),
            profile: Some(profile),
            accept_dialogs: config.accept_dialogs,
            log,
        }))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
    profile: Option<TempDir>,
    accept_dialogs: bool,
    log: EventLog,
}

impl ChromiumSession {
    async fn attach_listeners(&mut self, page: &chromiumoxide::Page) -> HarnessResult<()> {
        let listen_err = |e: chromiumoxide::error::CdpError| {
            HarnessError::Launch(format!("cannot subscribe to page events: {}", e))
        };

        let mut console = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(listen_err)?;
        let log = self.log.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(event) = console.next().await {
                let level = format!("{:?}", event.r#type).to_lowercase();
                let text = event
                    .args
                    .iter()
                    .map(remote_object_text)
                    .collect::<Vec<_>>()
                    .join(" ");
                log.console(level, text);
            }
        }));

        let mut exceptions = page
            .event_listener::<EventExceptionThrown>()
            .await
            .map_err(listen_err)?;
        let log = self.log.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                let details = &event.exception_details;
                let text = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                log.page_error(text);
            }
        }));

        if self.accept_dialogs {
            let mut dialogs = page
                .event_listener::<EventJavascriptDialogOpening>()
                .await
                .map_err(listen_err)?;
            let page = page.clone();
            self.pumps.push(tokio::spawn(async move {
                while let Some(event) = dialogs.next().await {
                    debug!("Accepting {:?} dialog: {}", event.r#type, event.message);
                    if let Err(e) = page.execute(HandleJavaScriptDialogParams::new(true)).await {
                        warn!("Failed to accept dialog: {}", e);
                    }
                }
            }));
        }

        Ok(())
    }
}

fn remote_object_text(object: &RemoteObject) -> String {
    match &object.value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => object
            .description
            .clone()
            .or_else(|| object.unserializable_value.as_ref().map(|v| v.inner().clone()))
            .unwrap_or_else(|| "undefined".to_string()),
    }
}

#[async_trait]
impl Session for ChromiumSession {
    async fn new_page(&mut self) -> HarnessResult<Arc<dyn Page>> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| HarnessError::Internal("session already closed".to_string()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarnessError::Launch(format!("cannot open page: {}", e)))?;

        self.attach_listeners(&page).await?;
        Ok(Arc::new(CdpPage::new(page)))
    }

    async fn close(&mut self) {
        let Some(mut browser) = self.browser.take() else {
            return;
        };

        debug!("Closing browser session");
        if let Err(e) = browser.close().await {
            warn!("Browser close request failed: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), browser.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Waiting for browser exit failed: {}", e),
            Err(_) => {
                warn!("Browser did not exit in time, killing it");
                if let Some(Err(e)) = browser.kill().await {
                    warn!("Failed to kill browser: {}", e);
                }
            }
        }

        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if let Some(profile) = self.profile.take() {
            if let Err(e) = profile.close() {
                debug!("Failed to remove profile dir: {}", e);
            }
        }
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}
