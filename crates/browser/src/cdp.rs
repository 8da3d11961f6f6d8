//! Minimal Chrome DevTools Protocol client over a WebSocket.
//!
//! One client owns the browser-level connection. Commands are correlated
//! by id through a pending map; events fan out to subscribers by method
//! name. Both halves of the socket run on dedicated tasks so a slow
//! command never blocks event delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use harvester_core::{Error, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;

pub struct CdpClient {
    cmd_tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    listeners: ListenerMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a DevTools WebSocket endpoint (browser-level or page-level).
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Cdp(format!("connect {ws_url}: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = cmd_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        debug!("devtools frame not json: {err}");
                        continue;
                    }
                };
                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = reader_pending.lock().await.remove(&id) {
                        let _ = tx.send(value);
                    }
                } else if let Some(method) = value.get("method").and_then(Value::as_str) {
                    let params = value.get("params").cloned().unwrap_or(Value::Null);
                    let mut map = reader_listeners.lock().await;
                    if let Some(subs) = map.get_mut(method) {
                        subs.retain(|tx| tx.send(params.clone()).is_ok());
                    }
                }
            }
            debug!("devtools connection closed");
        });

        Ok(Self {
            cmd_tx,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Subscribe to a DevTools event by method name, e.g. `Fetch.requestPaused`.
    pub async fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Send a command and wait for its response, returning `result`.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        if self.cmd_tx.send(Message::Text(frame.to_string())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Cdp(format!("{method}: connection closed")));
        }

        let response = match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::Cdp(format!("{method}: connection dropped")));
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Cdp(format!("{method}: timed out")));
            }
        };

        if let Some(err) = response.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Cdp(format!("{method}: {message}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Enable a protocol domain (`Page`, `Runtime`, `Network`, ...).
    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{domain}.enable"), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.send_command("Page.navigate", json!({ "url": url }))
            .await?;
        Ok(())
    }

    /// Evaluate a JavaScript expression in the page, awaiting promises and
    /// returning the materialized value. Page-side exceptions become errors.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("evaluation failed");
            return Err(Error::Cdp(format!("evaluate: {text}")));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Dispatch a raw key event. `key_code` is the Windows virtual key code
    /// that framework key handlers commonly match against.
    pub async fn dispatch_key_event(
        &self,
        event_type: &str,
        key: &str,
        code: &str,
        key_code: i64,
    ) -> Result<()> {
        let mut params = json!({
            "type": event_type,
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
            "nativeVirtualKeyCode": key_code,
        });
        if event_type == "keyDown" {
            if key == "Enter" {
                params["text"] = json!("\r");
            } else if key.chars().count() == 1 {
                params["text"] = json!(key);
            }
        }
        self.send_command("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    /// Enable request interception for the given URL patterns at the
    /// Request stage.
    pub async fn enable_fetch(&self, url_patterns: &[&str]) -> Result<()> {
        let patterns: Vec<Value> = url_patterns
            .iter()
            .map(|p| json!({ "urlPattern": p, "requestStage": "Request" }))
            .collect();
        self.send_command("Fetch.enable", json!({ "patterns": patterns }))
            .await?;
        Ok(())
    }

    /// Release a paused request unmodified.
    pub async fn continue_request(&self, request_id: &str) -> Result<()> {
        self.send_command("Fetch.continueRequest", json!({ "requestId": request_id }))
            .await?;
        Ok(())
    }

    pub async fn get_cookies(&self, urls: &[&str]) -> Result<Vec<Value>> {
        let result = self
            .send_command("Network.getCookies", json!({ "urls": urls }))
            .await?;
        Ok(result
            .get("cookies")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Set a single cookie; returns whether the browser accepted it.
    pub async fn set_cookie(&self, cookie: Value) -> Result<bool> {
        let result = self.send_command("Network.setCookie", cookie).await?;
        Ok(result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Expose a page-to-agent binding as `window.<name>(payload)`.
    pub async fn add_binding(&self, name: &str) -> Result<()> {
        self.send_command("Runtime.addBinding", json!({ "name": name }))
            .await?;
        Ok(())
    }

    /// Register a script that runs before any page script on every future
    /// navigation.
    pub async fn add_script_on_new_document(&self, source: &str) -> Result<String> {
        let result = self
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": source }),
            )
            .await?;
        Ok(result
            .get("identifier")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn browser_user_agent(&self) -> Result<String> {
        let result = self.send_command("Browser.getVersion", json!({})).await?;
        result
            .get("userAgent")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Cdp("Browser.getVersion returned no userAgent".into()))
    }

    /// Ask the browser to shut down. Tolerates the connection dying before
    /// the acknowledgement arrives.
    pub async fn close_browser(&self) {
        if let Err(err) = self.send_command("Browser.close", json!({})).await {
            warn!("browser close: {err}");
        }
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
