//! Test doubles shared by the agent's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use harvester_browser::{SendButtonState, StudioSurface, TARGET_MARKER};
use harvester_core::Result;
use harvester_storage::FlagStore;

use crate::orchestrator::RefreshTimings;

/// Scripted page double. Reply queues are consumed one call at a time;
/// when a queue runs dry the matching default answers instead.
pub(crate) struct FakeStudio {
    pub location: String,
    pub editor_replies: Mutex<VecDeque<bool>>,
    pub editor_default: bool,
    pub cleared_replies: Mutex<VecDeque<bool>>,
    pub cleared_default: bool,
    pub button_default: SendButtonState,
    pub calls: Mutex<Vec<&'static str>>,
    /// When set, `fill_editor` parks until notified.
    pub fill_gate: Option<Arc<Notify>>,
}

impl FakeStudio {
    pub fn at(location: &str) -> Self {
        Self {
            location: location.to_string(),
            editor_replies: Mutex::new(VecDeque::new()),
            editor_default: true,
            cleared_replies: Mutex::new(VecDeque::new()),
            cleared_default: true,
            button_default: SendButtonState::Enabled,
            calls: Mutex::new(Vec::new()),
            fill_gate: None,
        }
    }

    pub fn on_target() -> Self {
        Self::at(&format!(
            "https://console.cloud.google.com/vertex-ai/studio/multimodal?mode=prompt&model={TARGET_MARKER}"
        ))
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }
}

#[async_trait]
impl StudioSurface for FakeStudio {
    async fn location(&self) -> Result<String> {
        self.record("location");
        Ok(self.location.clone())
    }

    async fn navigate_to_target(&self) -> Result<()> {
        self.record("navigate");
        Ok(())
    }

    async fn dismiss_overlays(&self) -> Result<u64> {
        self.record("dismiss");
        Ok(0)
    }

    async fn editor_present(&self) -> Result<bool> {
        self.record("editor_present");
        let reply = self.editor_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(self.editor_default))
    }

    async fn fill_editor(&self, _text: &str) -> Result<()> {
        self.record("fill");
        if let Some(gate) = &self.fill_gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<()> {
        self.record("enter");
        Ok(())
    }

    async fn editor_cleared(&self) -> Result<bool> {
        self.record("cleared");
        let reply = self.cleared_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(self.cleared_default))
    }

    async fn send_button(&self) -> Result<SendButtonState> {
        self.record("button_state");
        Ok(self.button_default)
    }

    async fn click_send_button(&self) -> Result<()> {
        self.record("click");
        Ok(())
    }
}

pub(crate) fn fast_timings() -> RefreshTimings {
    RefreshTimings {
        editor_probes: 3,
        editor_retry: Duration::from_millis(1),
        input_settle: Duration::from_millis(1),
        clear_poll_interval: Duration::from_millis(1),
        enter_clear_polls: 2,
        button_clear_polls: 2,
        max_attempts: 3,
        attempt_pause: Duration::from_millis(1),
        complete_notice_delay: Duration::from_millis(1),
    }
}

pub(crate) fn temp_flags() -> (tempfile::TempDir, FlagStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FlagStore::new(dir.path().join("flags.json"));
    (dir, store)
}
