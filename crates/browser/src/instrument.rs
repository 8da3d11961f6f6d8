//! Page instrumentation. A reporting binding is exposed to the page and
//! observer scripts installed before any page script runs; reports come
//! back through `Runtime.bindingCalled` as typed events.
//!
//! The one observer shipped today wraps the enterprise challenge API so
//! the agent sees both challenge executions and the tokens they mint.
//! The wrapper calls straight through; page behavior is unchanged.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use harvester_core::Result;

use crate::cdp::CdpClient;

/// Name of the page-side reporting function.
pub const BINDING_NAME: &str = "__harvesterReport";

/// An event reported by an installed page observer.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    /// The page started a challenge execution.
    ChallengeExecution {
        site_key: Option<String>,
        options: Option<Value>,
    },
    /// A challenge resolved to a fresh token.
    ChallengeToken { token: String },
}

/// A named page-side script that reports through the shared binding.
pub struct PageInstrument {
    pub name: &'static str,
    pub source: String,
}

/// Observer that wraps `grecaptcha.enterprise.execute`, reporting each
/// execution and the token it resolves to. Installs at most once per
/// document and keeps polling until the challenge API shows up.
pub fn challenge_observer() -> PageInstrument {
    PageInstrument {
        name: "challenge-observer",
        source: challenge_observer_script(),
    }
}

fn challenge_observer_script() -> String {
    format!(
        r#"(() => {{
  if (window.__challengeObserverInstalled) return;
  window.__challengeObserverInstalled = true;
  const report = (payload) => {{
    try {{
      if (window.{BINDING_NAME}) window.{BINDING_NAME}(JSON.stringify(payload));
    }} catch (e) {{}}
  }};
  const wrap = () => {{
    const g = window.grecaptcha;
    if (!g || !g.enterprise || typeof g.enterprise.execute !== 'function' || g.enterprise.execute.__observed) {{
      return false;
    }}
    const original = g.enterprise.execute.bind(g.enterprise);
    const wrapped = (siteKey, options) => {{
      report({{ instrument: 'challenge', kind: 'execution', siteKey: siteKey, options: options }});
      const result = original(siteKey, options);
      if (result && typeof result.then === 'function') {{
        result.then((token) => report({{ instrument: 'challenge', kind: 'token', token: token }})).catch(() => {{}});
      }}
      return result;
    }};
    wrapped.__observed = true;
    g.enterprise.execute = wrapped;
    return true;
  }};
  if (!wrap()) {{
    const timer = setInterval(() => {{ if (wrap()) clearInterval(timer); }}, 1000);
  }}
}})();"#
    )
}

/// Parse a report delivered through the binding. Anything that does not
/// match a known instrument shape is discarded.
pub fn parse_report(payload: &str) -> Option<InstrumentEvent> {
    let value: Value = serde_json::from_str(payload).ok()?;
    if value.get("instrument").and_then(Value::as_str) != Some("challenge") {
        return None;
    }
    match value.get("kind").and_then(Value::as_str)? {
        "execution" => Some(InstrumentEvent::ChallengeExecution {
            site_key: value
                .get("siteKey")
                .and_then(Value::as_str)
                .map(str::to_string),
            options: value.get("options").filter(|o| !o.is_null()).cloned(),
        }),
        "token" => {
            let token = value.get("token").and_then(Value::as_str)?;
            if token.is_empty() {
                return None;
            }
            Some(InstrumentEvent::ChallengeToken {
                token: token.to_string(),
            })
        }
        _ => None,
    }
}

/// Installs registered instruments and turns their reports into
/// [`InstrumentEvent`]s.
pub struct InstrumentRegistry {
    cdp: Arc<CdpClient>,
    instruments: Vec<PageInstrument>,
    events: mpsc::UnboundedSender<InstrumentEvent>,
}

impl InstrumentRegistry {
    pub fn new(cdp: Arc<CdpClient>, events: mpsc::UnboundedSender<InstrumentEvent>) -> Self {
        Self {
            cdp,
            instruments: Vec::new(),
            events,
        }
    }

    pub fn register(&mut self, instrument: PageInstrument) {
        self.instruments.push(instrument);
    }

    /// Expose the binding, arm every instrument for future documents and
    /// inject each into the current one, then start relaying reports.
    pub async fn install(self) -> Result<JoinHandle<()>> {
        let mut reports = self.cdp.subscribe("Runtime.bindingCalled").await;
        self.cdp.add_binding(BINDING_NAME).await?;
        for instrument in &self.instruments {
            self.cdp.add_script_on_new_document(&instrument.source).await?;
            // The current document already missed the new-document hook.
            self.cdp.evaluate(&instrument.source).await?;
            info!(instrument = instrument.name, "page instrument installed");
        }

        Ok(tokio::spawn(async move {
            while let Some(params) = reports.recv().await {
                if params.get("name").and_then(Value::as_str) != Some(BINDING_NAME) {
                    continue;
                }
                let Some(payload) = params.get("payload").and_then(Value::as_str) else {
                    continue;
                };
                match parse_report(payload) {
                    Some(event) => {
                        match &event {
                            InstrumentEvent::ChallengeExecution { site_key, .. } => {
                                info!(site_key = site_key.as_deref(), "challenge execution observed");
                            }
                            InstrumentEvent::ChallengeToken { token } => {
                                info!(token_len = token.len(), "challenge token observed");
                            }
                        }
                        if self.events.send(event).is_err() {
                            break;
                        }
                    }
                    None => debug!("discarding unrecognized instrument report"),
                }
            }
            debug!("instrument report stream ended");
        }))
    }
}
