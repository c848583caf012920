//! Page commands built on `Session::submit`

use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use super::protocol::{ClipRect, ExceptionDetails, MouseButton, MouseEventType, RemoteObject};
use super::dispatcher::deadline_after;
use super::session::Session;
use super::CdpError;

/// Longest local wait a caller may request
pub const MAX_WAIT: Duration = Duration::from_secs(600);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct EvaluateOptions {
    pub await_promise: bool,
    pub return_by_value: bool,
    /// Overrides the session's command timeout
    pub timeout: Option<Duration>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            await_promise: true,
            return_by_value: true,
            timeout: None,
        }
    }
}

impl EvaluateOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationResult {
    pub frame_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ElementBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl Session {
    /// Load `url` and wait until the document is interactive, then optionally
    /// until `wait_for_selector` matches.
    pub async fn navigate(
        &self,
        url: &str,
        wait_for_selector: Option<&str>,
    ) -> Result<NavigationResult, CdpError> {
        if url.trim().is_empty() {
            return Err(CdpError::InvalidArgument("url must not be empty".to_string()));
        }
        url::Url::parse(url)
            .map_err(|e| CdpError::InvalidArgument(format!("invalid url '{}': {}", url, e)))?;
        if let Some(selector) = wait_for_selector {
            check_selector(selector)?;
        }

        let result = self.submit("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            if !error.is_empty() {
                return Err(CdpError::Navigation(format!("{}: {}", url, error)));
            }
        }
        let frame_id = result
            .get("frameId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let deadline = deadline_after(Instant::now(), self.command_timeout());
        self.wait_for_ready_state(deadline).await?;
        if let Some(selector) = wait_for_selector {
            self.wait_for_selector_until(selector, deadline).await?;
        }

        info!(url, frame = %frame_id, "Navigated");
        Ok(NavigationResult {
            frame_id,
            url: url.to_string(),
        })
    }

    /// Evaluate `source` in the page and return its value
    pub async fn evaluate(&self, source: &str, options: EvaluateOptions) -> Result<Value, CdpError> {
        if source.trim().is_empty() {
            return Err(CdpError::InvalidArgument(
                "expression must not be empty".to_string(),
            ));
        }

        let params = json!({
            "expression": source,
            "awaitPromise": options.await_promise,
            "returnByValue": options.return_by_value,
        });
        let timeout = options.timeout.unwrap_or_else(|| self.command_timeout());
        let result = self
            .submit_with_timeout("Runtime.evaluate", params, timeout)
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let details: ExceptionDetails = serde_json::from_value(details.clone())?;
            return Err(CdpError::JavaScript(details.message()));
        }

        let remote = result
            .get("result")
            .cloned()
            .ok_or_else(|| CdpError::InvalidResponse("Runtime.evaluate without result".to_string()))?;
        if !options.return_by_value {
            return Ok(remote);
        }

        let object: RemoteObject = serde_json::from_value(remote)?;
        Ok(match (object.value, object.unserializable_value) {
            (Some(value), _) => value,
            (None, Some(unserializable)) => Value::String(unserializable),
            (None, None) => Value::Null,
        })
    }

    /// Capture a PNG of the viewport, or of one element when `selector` is given
    pub async fn screenshot(&self, selector: Option<&str>) -> Result<Vec<u8>, CdpError> {
        let mut params = json!({ "format": "png" });
        if let Some(selector) = selector {
            let rect = self.element_box(selector, false).await?;
            let clip = ClipRect {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                scale: 1.0,
            };
            params["clip"] = serde_json::to_value(clip)?;
            params["captureBeyondViewport"] = json!(true);
        }

        let result = self.submit("Page.captureScreenshot", params).await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| CdpError::InvalidResponse("screenshot without data".to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| CdpError::InvalidResponse(format!("screenshot data: {}", e)))
    }

    /// Left-click the centre of the first element matching `selector`
    pub async fn click(&self, selector: &str) -> Result<(), CdpError> {
        let rect = self.element_box(selector, true).await?;
        let x = rect.x + rect.width / 2.0;
        let y = rect.y + rect.height / 2.0;

        for event in [MouseEventType::MousePressed, MouseEventType::MouseReleased] {
            self.submit(
                "Input.dispatchMouseEvent",
                json!({
                    "type": event,
                    "x": x,
                    "y": y,
                    "button": MouseButton::Left,
                    "clickCount": 1,
                }),
            )
            .await?;
        }
        debug!(selector, x, y, "Clicked element");
        Ok(())
    }

    pub async fn scroll(&self, delta_x: f64, delta_y: f64) -> Result<(), CdpError> {
        if !delta_x.is_finite() || !delta_y.is_finite() {
            return Err(CdpError::InvalidArgument(
                "scroll deltas must be finite".to_string(),
            ));
        }
        self.submit(
            "Input.dispatchMouseEvent",
            json!({
                "type": MouseEventType::MouseWheel,
                "x": 0,
                "y": 0,
                "button": MouseButton::None,
                "deltaX": delta_x,
                "deltaY": delta_y,
            }),
        )
        .await?;
        Ok(())
    }

    /// Sleep locally; nothing is sent to the browser
    pub async fn wait(&self, duration: Duration) -> Result<(), CdpError> {
        if duration > MAX_WAIT {
            return Err(CdpError::InvalidArgument(format!(
                "wait of {:?} exceeds the {:?} limit",
                duration, MAX_WAIT
            )));
        }
        tokio::time::sleep(duration).await;
        Ok(())
    }

    pub async fn title(&self) -> Result<String, CdpError> {
        self.evaluate_string("document.title").await
    }

    pub async fn current_url(&self) -> Result<String, CdpError> {
        self.evaluate_string("window.location.href").await
    }

    /// Outer HTML of the document
    pub async fn content(&self) -> Result<String, CdpError> {
        self.evaluate_string("document.documentElement ? document.documentElement.outerHTML : ''")
            .await
    }

    async fn evaluate_string(&self, expression: &str) -> Result<String, CdpError> {
        let value = self.evaluate(expression, EvaluateOptions::default()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn wait_for_ready_state(&self, deadline: Instant) -> Result<(), CdpError> {
        let started = Instant::now();
        loop {
            let state = self
                .evaluate("document.readyState", EvaluateOptions::default())
                .await?;
            if matches!(state.as_str(), Some("interactive") | Some("complete")) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CdpError::Timeout {
                    operation: "page load".to_string(),
                    after: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_selector_until(
        &self,
        selector: &str,
        deadline: Instant,
    ) -> Result<(), CdpError> {
        let started = Instant::now();
        let probe = format!("document.querySelector({}) !== null", js_string(selector)?);
        loop {
            let found = self.evaluate(&probe, EvaluateOptions::default()).await?;
            if found.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CdpError::Timeout {
                    operation: format!("waiting for selector '{}'", selector),
                    after: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Bounding box of the first match, in viewport or document coordinates
    async fn element_box(&self, selector: &str, viewport: bool) -> Result<ElementBox, CdpError> {
        check_selector(selector)?;
        let script = format!(
            r#"(() => {{
    const el = document.querySelector({selector});
    if (!el) return null;
    el.scrollIntoView({{ block: "center", inline: "center" }});
    const r = el.getBoundingClientRect();
    const ox = {viewport} ? 0 : window.scrollX;
    const oy = {viewport} ? 0 : window.scrollY;
    return {{ x: r.left + ox, y: r.top + oy, width: r.width, height: r.height }};
}})()"#,
            selector = js_string(selector)?,
            viewport = viewport,
        );

        let value = self.evaluate(&script, EvaluateOptions::default()).await?;
        if value.is_null() {
            return Err(CdpError::ElementNotFound(selector.to_string()));
        }
        let rect: ElementBox = serde_json::from_value(value)?;
        if rect.width <= 0.0 || rect.height <= 0.0 {
            return Err(CdpError::ElementNotFound(format!(
                "{} (element has no visible area)",
                selector
            )));
        }
        Ok(rect)
    }
}

fn check_selector(selector: &str) -> Result<(), CdpError> {
    if selector.trim().is_empty() {
        return Err(CdpError::InvalidArgument(
            "selector must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Quote `text` as a JavaScript string literal
fn js_string(text: &str) -> Result<String, CdpError> {
    Ok(serde_json::to_string(text)?)
}
