//! Chromium page over the DevTools protocol

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport as ClipRect};
use chromiumoxide::cdp::js_protocol::runtime::{EvaluateParams, ExceptionDetails};
use chromiumoxide::error::CdpError;
use chromiumoxide::layout::Point;
use chromiumoxide::page::ScreenshotParams;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::page::{CaptureTarget, ElementState, Page};
use crate::selector::Selector;

const LOCATOR_RUNTIME: &str = include_str!("js/locator.js");

/// Reply envelope of the locator runtime
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Reply {
    ok: bool,
    reason: Option<String>,
    elements: Vec<ElementState>,
    value: Option<String>,
    missing_option: bool,
    options: Vec<String>,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

pub struct CdpPage {
    page: chromiumoxide::Page,
}

impl CdpPage {
    pub fn new(page: chromiumoxide::Page) -> Self {
        Self { page }
    }

    async fn eval_expression(&self, expression: String) -> HarnessResult<Value> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(HarnessError::Internal)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(evaluation_error)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn locate(
        &self,
        op: &str,
        selector: &Selector,
        index: usize,
        arg: Option<&str>,
    ) -> HarnessResult<Reply> {
        let request = json!({
            "op": op,
            "segments": selector.segments(),
            "index": index,
            "arg": arg,
        });
        let expression = format!("({})({})", LOCATOR_RUNTIME, request);
        let value = self.eval_expression(expression).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn act(
        &self,
        op: &str,
        selector: &Selector,
        index: usize,
        arg: Option<&str>,
    ) -> HarnessResult<Reply> {
        let reply = self.locate(op, selector, index, arg).await?;
        if reply.ok || reply.missing_option {
            Ok(reply)
        } else {
            Err(HarnessError::ElementResolution {
                selector: selector.to_string(),
                reason: reply.reason.unwrap_or_else(|| format!("{} failed", op)),
            })
        }
    }
}

fn exception_text(details: &ExceptionDetails) -> String {
    details
        .exception
        .as_ref()
        .and_then(|e| e.description.clone())
        .unwrap_or_else(|| details.text.clone())
}

fn evaluation_error(err: CdpError) -> HarnessError {
    match err {
        CdpError::JavascriptException(details) => HarnessError::Evaluation(exception_text(&details)),
        other => HarnessError::Evaluation(other.to_string()),
    }
}

#[async_trait]
impl Page for CdpPage {
    async fn goto(&self, url: &str) -> HarnessResult<()> {
        debug!("goto {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| HarnessError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn reload(&self) -> HarnessResult<()> {
        self.page
            .reload()
            .await
            .map_err(|e| HarnessError::Navigation {
                url: "(reload)".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn query(&self, selector: &Selector) -> HarnessResult<Vec<ElementState>> {
        Ok(self.locate("query", selector, 0, None).await?.elements)
    }

    async fn computed_style(
        &self,
        selector: &Selector,
        index: usize,
        property: &str,
    ) -> HarnessResult<Option<String>> {
        Ok(self.act("style", selector, index, Some(property)).await?.value)
    }

    async fn click(&self, selector: &Selector, index: usize, force: bool) -> HarnessResult<()> {
        if force {
            self.act("force_click", selector, index, None).await?;
            return Ok(());
        }

        let target = self.act("point", selector, index, None).await?;
        self.page
            .click(Point {
                x: target.x,
                y: target.y,
            })
            .await
            .map_err(|e| HarnessError::ElementResolution {
                selector: selector.to_string(),
                reason: format!("mouse click failed: {}", e),
            })?;
        Ok(())
    }

    async fn fill(&self, selector: &Selector, index: usize, text: &str) -> HarnessResult<()> {
        self.act("fill", selector, index, Some(text)).await?;
        Ok(())
    }

    async fn select_option(
        &self,
        selector: &Selector,
        index: usize,
        value: &str,
    ) -> HarnessResult<()> {
        let reply = self.act("select", selector, index, Some(value)).await?;
        if reply.missing_option {
            return Err(HarnessError::OptionNotFound {
                selector: selector.to_string(),
                value: value.to_string(),
                available: reply.options,
            });
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, arg: Option<&Value>) -> HarnessResult<Value> {
        let expression = match arg {
            Some(arg) => format!("({})({})", script, arg),
            None => script.to_string(),
        };
        self.eval_expression(expression).await
    }

    async fn screenshot(&self, target: &CaptureTarget) -> HarnessResult<Vec<u8>> {
        let builder = ScreenshotParams::builder().format(CaptureScreenshotFormat::Png);
        let params = match target {
            CaptureTarget::Viewport => builder.build(),
            CaptureTarget::FullPage => builder.full_page(true).build(),
            CaptureTarget::Element(selector) => {
                let rect = self.act("clip", selector, 0, None).await?;
                builder
                    .clip(ClipRect {
                        x: rect.x,
                        y: rect.y,
                        width: rect.width,
                        height: rect.height,
                        scale: 1.0,
                    })
                    .capture_beyond_viewport(true)
                    .build()
            }
        };

        self.page
            .screenshot(params)
            .await
            .map_err(|e| HarnessError::Internal(format!("screenshot failed: {}", e)))
    }
}
