//! Contract with the hosted prompt studio: where it lives, how to find
//! its composer, and how a refresh probe is typed and confirmed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use harvester_core::{Error, Result};

use crate::cdp::CdpClient;

/// Address of the prompt studio, pinned to the model the backend expects.
pub const TARGET_URL: &str = "https://console.cloud.google.com/vertex-ai/studio/multimodal?mode=prompt&model=gemini-2.5-flash-lite-preview-09-2025";

/// Substring of the current location that proves the right surface is open.
pub const TARGET_MARKER: &str = "gemini-2.5-flash-lite-preview-09-2025";

/// Throwaway prompt typed to exercise a full authenticated round trip.
pub const PROBE_TEXT: &str = "Hello";

const EDITOR_SELECTOR: &str = r#"div[contenteditable="true"]"#;
const SEND_BUTTON_SELECTOR: &str = r#"button[aria-label="Send message"]"#;

/// Observed state of the studio's send button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendButtonState {
    Missing,
    Disabled,
    Enabled,
}

/// The operations a refresh needs from the hosted page. The production
/// implementation drives a real page over DevTools; tests substitute a
/// scripted fake.
#[async_trait]
pub trait StudioSurface: Send + Sync {
    /// Current location of the page.
    async fn location(&self) -> Result<String>;

    /// Begin navigating to the studio. Returns once the navigation is
    /// issued, not once the page has loaded.
    async fn navigate_to_target(&self) -> Result<()>;

    /// Best-effort dismissal of consent and first-run overlays. Returns
    /// how many controls were clicked.
    async fn dismiss_overlays(&self) -> Result<u64>;

    async fn editor_present(&self) -> Result<bool>;

    /// Focus the composer and replace its content with `text`.
    async fn fill_editor(&self, text: &str) -> Result<()>;

    async fn press_enter(&self) -> Result<()>;

    /// Whether the composer has emptied, which is how the studio signals
    /// it accepted the message.
    async fn editor_cleared(&self) -> Result<bool>;

    async fn send_button(&self) -> Result<SendButtonState>;

    async fn click_send_button(&self) -> Result<()>;
}

/// Escape text for embedding inside a single-quoted JavaScript literal.
pub fn js_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// DevTools-backed implementation of [`StudioSurface`].
pub struct StudioPage {
    cdp: Arc<CdpClient>,
}

impl StudioPage {
    pub fn new(cdp: Arc<CdpClient>) -> Self {
        Self { cdp }
    }
}

#[async_trait]
impl StudioSurface for StudioPage {
    async fn location(&self) -> Result<String> {
        let value = self.cdp.evaluate("window.location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Cdp("location.href was not a string".into()))
    }

    async fn navigate_to_target(&self) -> Result<()> {
        self.cdp.navigate(TARGET_URL).await
    }

    async fn dismiss_overlays(&self) -> Result<u64> {
        const SCRIPT: &str = r#"(() => {
  let clicked = 0;
  for (const sel of ['button[aria-label="Close"]', 'button[aria-label="Dismiss"]']) {
    const btn = document.querySelector(sel);
    if (btn) { btn.click(); clicked += 1; }
  }
  const box = document.querySelector('mat-checkbox input[type="checkbox"]:not(:checked)');
  if (box && /accept|terms/i.test((box.closest('mat-checkbox') || box).textContent || '')) {
    box.click();
    clicked += 1;
  }
  const labels = ['Got it', 'Agree', 'OK', 'No thanks', 'Not now', 'Close', 'Done'];
  for (const dialog of document.querySelectorAll('div[role="dialog"], mat-dialog-container')) {
    for (const btn of dialog.querySelectorAll('button')) {
      if (labels.includes((btn.textContent || '').trim())) { btn.click(); clicked += 1; break; }
    }
  }
  return clicked;
})()"#;
        let value = self.cdp.evaluate(SCRIPT).await?;
        let clicked = value.as_u64().unwrap_or(0);
        if clicked > 0 {
            debug!(clicked, "dismissed page overlays");
        }
        Ok(clicked)
    }

    async fn editor_present(&self) -> Result<bool> {
        let script = format!("!!document.querySelector('{EDITOR_SELECTOR}')");
        Ok(self.cdp.evaluate(&script).await?.as_bool().unwrap_or(false))
    }

    async fn fill_editor(&self, text: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
  const editor = document.querySelector('{EDITOR_SELECTOR}');
  if (!editor) return false;
  editor.focus();
  editor.innerText = {payload};
  editor.dispatchEvent(new InputEvent('input', {{ bubbles: true, inputType: 'insertText', data: {payload} }}));
  return true;
}})()"#,
            payload = js_string(text),
        );
        let filled = self.cdp.evaluate(&script).await?.as_bool().unwrap_or(false);
        if !filled {
            return Err(Error::Refresh("composer disappeared before it was filled".into()));
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<()> {
        self.cdp
            .dispatch_key_event("keyDown", "Enter", "Enter", 13)
            .await?;
        self.cdp
            .dispatch_key_event("keyUp", "Enter", "Enter", 13)
            .await
    }

    async fn editor_cleared(&self) -> Result<bool> {
        // A composer that re-rendered away counts as cleared; it only
        // happens after the studio consumed the message.
        let script = format!(
            r#"(() => {{
  const editor = document.querySelector('{EDITOR_SELECTOR}');
  if (!editor) return true;
  return (editor.innerText || '').trim().length === 0;
}})()"#
        );
        Ok(self.cdp.evaluate(&script).await?.as_bool().unwrap_or(false))
    }

    async fn send_button(&self) -> Result<SendButtonState> {
        let script = format!(
            r#"(() => {{
  const btn = document.querySelector('{SEND_BUTTON_SELECTOR}');
  if (!btn) return 'missing';
  if (btn.disabled || btn.getAttribute('aria-disabled') === 'true') return 'disabled';
  return 'enabled';
}})()"#
        );
        let value = self.cdp.evaluate(&script).await?;
        Ok(match value.as_str() {
            Some("enabled") => SendButtonState::Enabled,
            Some("disabled") => SendButtonState::Disabled,
            _ => SendButtonState::Missing,
        })
    }

    async fn click_send_button(&self) -> Result<()> {
        let script = format!(
            r#"(() => {{
  const btn = document.querySelector('{SEND_BUTTON_SELECTOR}');
  if (!btn) return false;
  btn.click();
  return true;
}})()"#
        );
        let clicked = self.cdp.evaluate(&script).await?.as_bool().unwrap_or(false);
        if !clicked {
            return Err(Error::Refresh("send button vanished before click".into()));
        }
        Ok(())
    }
}
