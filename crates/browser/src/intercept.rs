//! Outbound request interception. Paused requests are always released
//! before anything else happens; harvesting runs on a copy and can never
//! hold up or alter page traffic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use harvester_core::{CredentialEnvelope, Result};

use crate::cdp::CdpClient;

/// Interception pattern handed to the browser. Every outbound request
/// pauses; the filter below makes the call after the release.
pub const URL_PATTERN: &str = "*";

const URL_MARKER: &str = "batchGraphql";

/// Operation names that mark a request as carrying model-call credentials.
pub const OPERATION_MARKERS: &[&str] = &[
    "StreamGenerateContent",
    "generateContent",
    "Predict",
    "GenerateImage",
];

const BODY_PREVIEW_BYTES: usize = 200;

/// True when a request is one the backend can replay: the batch endpoint,
/// with a body naming one of the model-call operations.
pub fn matches_target(request_url: &str, body: &str) -> bool {
    request_url.contains(URL_MARKER) && OPERATION_MARKERS.iter().any(|op| body.contains(op))
}

/// GraphQL operation names found in a batch body, for logging. Bodies the
/// page sends as a single object or as a batch array both work.
pub fn operation_names(body: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Vec::new();
    };
    fn push_name(value: &Value, names: &mut Vec<String>) {
        if let Some(name) = value.get("operationName").and_then(Value::as_str) {
            names.push(name.to_string());
        }
    }
    let mut names = Vec::new();
    match &value {
        Value::Array(items) => {
            for item in items {
                push_name(item, &mut names);
            }
        }
        other => push_name(other, &mut names),
    }
    names
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn has_header(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|k| k.eq_ignore_ascii_case(name))
}

/// Insert a header only when no spelling of it is already present. The
/// page's own values always win over ambient ones.
pub fn merge_header(headers: &mut HashMap<String, String>, name: &str, value: String) {
    if !has_header(headers, name) {
        headers.insert(name.to_string(), value);
    }
}

/// Header map from a paused request's `headers` object. Non-string
/// values are skipped.
pub fn capture_headers(request: &Value) -> HashMap<String, String> {
    request
        .get("headers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Render browser cookies as a `Cookie` request header value.
pub fn cookie_header(cookies: &[Value]) -> String {
    cookies
        .iter()
        .filter_map(|c| {
            let name = c.get("name").and_then(Value::as_str)?;
            let value = c.get("value").and_then(Value::as_str)?;
            Some(format!("{name}={value}"))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Watches the page's outbound traffic and emits a credential envelope
/// for every replayable model call it sees.
pub struct Interceptor {
    cdp: Arc<CdpClient>,
    user_agent: String,
    envelopes: mpsc::UnboundedSender<CredentialEnvelope>,
}

impl Interceptor {
    pub fn new(
        cdp: Arc<CdpClient>,
        user_agent: impl Into<String>,
        envelopes: mpsc::UnboundedSender<CredentialEnvelope>,
    ) -> Self {
        Self {
            cdp,
            user_agent: user_agent.into(),
            envelopes,
        }
    }

    /// Subscribe to paused requests, then enable interception. Ordering
    /// matters: the subscription must exist before the first pause or the
    /// request would hang unreleased.
    pub async fn install(self) -> Result<JoinHandle<()>> {
        let mut paused = self.cdp.subscribe("Fetch.requestPaused").await;
        self.cdp.enable_fetch(&[URL_PATTERN]).await?;
        info!(filter = URL_MARKER, "request interception active");
        Ok(tokio::spawn(async move {
            while let Some(event) = paused.recv().await {
                self.handle_paused(event).await;
            }
            debug!("interception event stream ended");
        }))
    }

    async fn handle_paused(&self, event: Value) {
        let Some(request_id) = event.get("requestId").and_then(Value::as_str) else {
            return;
        };
        // Release first. The page must proceed whether or not we harvest.
        if let Err(err) = self.cdp.continue_request(request_id).await {
            debug!(request_id, "continue request failed: {err}");
        }

        let Some(request) = event.get("request") else {
            return;
        };
        let url = request.get("url").and_then(Value::as_str).unwrap_or("");
        let body = request.get("postData").and_then(Value::as_str).unwrap_or("");
        if !matches_target(url, body) {
            return;
        }

        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_string();
        let mut headers = capture_headers(request);
        self.merge_ambient(&mut headers, url).await;

        let operations = operation_names(body);
        info!(url, ?operations, "credential envelope captured");
        debug!(
            preview = truncate_utf8(body, BODY_PREVIEW_BYTES),
            "envelope body"
        );

        let envelope = CredentialEnvelope {
            url: url.to_string(),
            method,
            headers,
            body: body.to_string(),
        };
        if self.envelopes.send(envelope).is_err() {
            debug!("envelope receiver gone, dropping capture");
        }
    }

    /// Fill in headers the intercepted request relies on ambiently. The
    /// backend replays the envelope from outside the browser, so it needs
    /// them spelled out.
    async fn merge_ambient(&self, headers: &mut HashMap<String, String>, request_url: &str) {
        if !has_header(headers, "cookie") {
            match self.cdp.get_cookies(&[request_url]).await {
                Ok(cookies) if !cookies.is_empty() => {
                    merge_header(headers, "Cookie", cookie_header(&cookies));
                }
                Ok(_) => {}
                Err(err) => debug!("cookie lookup failed: {err}"),
            }
        }
        merge_header(headers, "User-Agent", self.user_agent.clone());
        if !has_header(headers, "origin") || !has_header(headers, "referer") {
            match self.cdp.evaluate("window.location.href").await {
                Ok(value) => {
                    if let Some(href) = value.as_str() {
                        if let Ok(parsed) = Url::parse(href) {
                            merge_header(
                                headers,
                                "Origin",
                                parsed.origin().ascii_serialization(),
                            );
                        }
                        merge_header(headers, "Referer", href.to_string());
                    }
                }
                Err(err) => debug!("location lookup failed: {err}"),
            }
        }
    }
}
