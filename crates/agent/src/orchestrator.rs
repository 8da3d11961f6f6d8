//! Session refresh orchestration. One refresh walks the hosted studio
//! through a full authenticated round trip: confirm the page is on the
//! studio (redirecting and leaving a durable resume marker when it is
//! not), type a throwaway probe, and watch the composer empty, which is
//! how the studio signals it accepted the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use harvester_browser::{SendButtonState, StudioSurface, PROBE_TEXT, TARGET_MARKER};
use harvester_channel::ChannelHandle;
use harvester_core::{ChannelMessage, Error, Result};
use harvester_storage::FlagStore;

/// Pacing of a refresh run. Defaults are tuned to how the hosted page
/// behaves for a person; tests shrink them.
#[derive(Debug, Clone)]
pub struct RefreshTimings {
    /// Probes for the composer before the run is abandoned.
    pub editor_probes: u32,
    /// Pause between composer probes.
    pub editor_retry: Duration,
    /// Settle time between filling the composer and pressing Enter.
    pub input_settle: Duration,
    /// Pause between composer-cleared polls.
    pub clear_poll_interval: Duration,
    /// Cleared polls granted to the Enter press.
    pub enter_clear_polls: u32,
    /// Cleared polls granted to the send-button fallback.
    pub button_clear_polls: u32,
    /// Whole probe attempts before the run fails.
    pub max_attempts: u32,
    /// Pause between probe attempts.
    pub attempt_pause: Duration,
    /// Delay before the backend hears the refresh completed, leaving the
    /// studio time to start answering the probe.
    pub complete_notice_delay: Duration,
}

impl Default for RefreshTimings {
    fn default() -> Self {
        Self {
            editor_probes: 3,
            editor_retry: Duration::from_secs(1),
            input_settle: Duration::from_millis(100),
            clear_poll_interval: Duration::from_millis(100),
            enter_clear_polls: 20,
            button_clear_polls: 10,
            max_attempts: 3,
            attempt_pause: Duration::from_millis(500),
            complete_notice_delay: Duration::from_millis(1500),
        }
    }
}

/// How a refresh run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The page was somewhere else. A navigation to the studio was issued
    /// and the resume marker set; the run continues after the reload.
    Redirected,
    /// The studio accepted the probe and the backend was notified.
    Completed,
    /// Another refresh holds the page; this trigger was dropped.
    Busy,
}

enum ProbeAttempt {
    Accepted,
    NotAccepted,
}

pub struct RefreshOrchestrator {
    studio: Arc<dyn StudioSurface>,
    channel: ChannelHandle,
    flags: FlagStore,
    timings: RefreshTimings,
    busy: Mutex<()>,
}

impl RefreshOrchestrator {
    pub fn new(studio: Arc<dyn StudioSurface>, channel: ChannelHandle, flags: FlagStore) -> Self {
        Self {
            studio,
            channel,
            flags,
            timings: RefreshTimings::default(),
            busy: Mutex::new(()),
        }
    }

    pub fn with_timings(mut self, timings: RefreshTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Run one refresh. The page is a single shared surface, so a trigger
    /// arriving while a run holds it is rejected, never queued.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Ok(_guard) = self.busy.try_lock() else {
            info!("refresh already running, dropping trigger");
            return Ok(RefreshOutcome::Busy);
        };
        let run_id = Uuid::new_v4().simple().to_string();
        let run = &run_id[..8];
        info!(run, "session refresh started");

        let location = self.studio.location().await?;
        if !location.contains(TARGET_MARKER) {
            info!(run, location, "page is off the studio, redirecting");
            self.flags.set_resume_pending()?;
            self.studio.navigate_to_target().await?;
            return Ok(RefreshOutcome::Redirected);
        }

        self.locate_editor(run).await?;

        for attempt in 1..=self.timings.max_attempts {
            match self.attempt_probe().await? {
                ProbeAttempt::Accepted => {
                    info!(run, attempt, "studio accepted the probe");
                    sleep(self.timings.complete_notice_delay).await;
                    self.channel.send(ChannelMessage::RefreshComplete);
                    return Ok(RefreshOutcome::Completed);
                }
                ProbeAttempt::NotAccepted => {
                    warn!(run, attempt, "probe was not accepted");
                    if attempt < self.timings.max_attempts {
                        sleep(self.timings.attempt_pause).await;
                    }
                }
            }
        }
        Err(Error::Refresh(format!(
            "probe never accepted after {} attempts",
            self.timings.max_attempts
        )))
    }

    /// Find the composer. Overlays are cleared before every probe so a
    /// consent dialog cannot mask it. Exhausting the probes fails the
    /// whole run.
    async fn locate_editor(&self, run: &str) -> Result<()> {
        for probe in 1..=self.timings.editor_probes {
            if let Err(err) = self.studio.dismiss_overlays().await {
                debug!(run, "overlay dismissal failed: {err}");
            }
            if self.studio.editor_present().await? {
                return Ok(());
            }
            debug!(run, probe, "composer not found");
            if probe < self.timings.editor_probes {
                sleep(self.timings.editor_retry).await;
            }
        }
        Err(Error::Refresh(format!(
            "composer never appeared after {} probes",
            self.timings.editor_probes
        )))
    }

    async fn attempt_probe(&self) -> Result<ProbeAttempt> {
        self.studio.fill_editor(PROBE_TEXT).await?;
        sleep(self.timings.input_settle).await;
        self.studio.press_enter().await?;
        if self.poll_cleared(self.timings.enter_clear_polls).await? {
            return Ok(ProbeAttempt::Accepted);
        }

        match self.studio.send_button().await? {
            SendButtonState::Enabled => {
                debug!("composer did not clear, falling back to the send button");
                self.studio.click_send_button().await?;
                if self.poll_cleared(self.timings.button_clear_polls).await? {
                    return Ok(ProbeAttempt::Accepted);
                }
            }
            state => debug!(?state, "send button unavailable for fallback"),
        }
        Ok(ProbeAttempt::NotAccepted)
    }

    async fn poll_cleared(&self, polls: u32) -> Result<bool> {
        for _ in 0..polls {
            sleep(self.timings.clear_poll_interval).await;
            if self.studio.editor_cleared().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use tokio::sync::{mpsc, Notify};
    use tokio::time::timeout;

    use crate::testutil::{fast_timings, temp_flags, FakeStudio};

    struct Rig {
        orchestrator: Arc<RefreshOrchestrator>,
        studio: Arc<FakeStudio>,
        outbound: mpsc::UnboundedReceiver<ChannelMessage>,
        flags: FlagStore,
        _dir: tempfile::TempDir,
    }

    fn rig(studio: FakeStudio) -> Rig {
        let studio = Arc::new(studio);
        let (handle, outbound) = ChannelHandle::open_pair();
        let (dir, flags) = temp_flags();
        let orchestrator = Arc::new(
            RefreshOrchestrator::new(studio.clone(), handle, flags.clone())
                .with_timings(fast_timings()),
        );
        Rig {
            orchestrator,
            studio,
            outbound,
            flags,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn off_studio_location_redirects_and_marks_resume() {
        let mut r = rig(FakeStudio::at("https://accounts.google.com/v3/signin/challenge"));
        let outcome = r.orchestrator.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Redirected);
        assert_eq!(r.studio.count("navigate"), 1);
        assert_eq!(r.studio.count("fill"), 0);
        assert!(r.flags.resume_pending());
        assert!(r.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn accepted_probe_completes_and_notifies_backend() {
        let mut r = rig(FakeStudio::on_target());
        let outcome = r.orchestrator.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Completed);
        assert_eq!(r.studio.count("fill"), 1);
        assert_eq!(r.studio.count("enter"), 1);
        assert_eq!(r.studio.count("navigate"), 0);
        assert!(!r.flags.resume_pending());
        let notice = r.outbound.try_recv().unwrap();
        assert_eq!(notice.kind(), "refresh_complete");
    }

    #[tokio::test]
    async fn missing_composer_is_terminal_after_three_probes() {
        let mut fake = FakeStudio::on_target();
        fake.editor_default = false;
        let mut r = rig(fake);
        let err = r.orchestrator.refresh().await.unwrap_err();
        assert!(err.to_string().contains("composer never appeared"));
        assert_eq!(r.studio.count("editor_present"), 3);
        assert_eq!(r.studio.count("dismiss"), 3);
        assert_eq!(r.studio.count("fill"), 0);
        assert!(r.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_button_fallback_rescues_the_probe() {
        let mut fake = FakeStudio::on_target();
        // Both Enter polls come back dirty; the poll after the button
        // click sees the composer empty.
        fake.cleared_replies = std::sync::Mutex::new(VecDeque::from([false, false, true]));
        let mut r = rig(fake);
        let outcome = r.orchestrator.refresh().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Completed);
        assert_eq!(r.studio.count("click"), 1);
        assert_eq!(r.outbound.try_recv().unwrap().kind(), "refresh_complete");
    }

    #[tokio::test]
    async fn never_clearing_composer_fails_after_three_attempts() {
        let mut fake = FakeStudio::on_target();
        fake.cleared_default = false;
        let mut r = rig(fake);
        let err = r.orchestrator.refresh().await.unwrap_err();
        assert!(err.to_string().contains("never accepted"));
        assert_eq!(r.studio.count("fill"), 3);
        assert_eq!(r.studio.count("click"), 3);
        assert!(r.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected_not_queued() {
        let gate = Arc::new(Notify::new());
        let mut fake = FakeStudio::on_target();
        fake.fill_gate = Some(gate.clone());
        let r = rig(fake);

        let first = {
            let orchestrator = r.orchestrator.clone();
            tokio::spawn(async move { orchestrator.refresh().await })
        };
        timeout(Duration::from_secs(5), async {
            while r.studio.count("fill") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("first run never reached the composer");

        let second = r.orchestrator.refresh().await.unwrap();
        assert_eq!(second, RefreshOutcome::Busy);

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, RefreshOutcome::Completed);
        assert_eq!(r.studio.count("fill"), 1);
    }
}
