//! Decides when refreshes run: a warmup pass shortly after launch, a
//! steady keepalive cadence, backend commands, and resume passes after
//! page loads that follow a redirect. Every trigger funnels into the
//! same orchestrator, whose busy guard keeps runs from overlapping.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use harvester_core::ChannelMessage;
use harvester_storage::FlagStore;

use crate::orchestrator::RefreshOrchestrator;

const WARMUP_DELAY: Duration = Duration::from_secs(5);
const RESUME_DELAY: Duration = Duration::from_secs(5);

pub struct RefreshScheduler {
    orchestrator: Arc<RefreshOrchestrator>,
    flags: FlagStore,
    keepalive: Duration,
    warmup_delay: Duration,
    resume_delay: Duration,
    commands: mpsc::UnboundedReceiver<ChannelMessage>,
    page_loads: mpsc::UnboundedReceiver<Value>,
}

impl RefreshScheduler {
    pub fn new(
        orchestrator: Arc<RefreshOrchestrator>,
        flags: FlagStore,
        keepalive: Duration,
        commands: mpsc::UnboundedReceiver<ChannelMessage>,
        page_loads: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            orchestrator,
            flags,
            keepalive,
            warmup_delay: WARMUP_DELAY,
            resume_delay: RESUME_DELAY,
            commands,
            page_loads,
        }
    }

    /// Override the warmup and resume delays.
    pub fn with_delays(mut self, warmup: Duration, resume: Duration) -> Self {
        self.warmup_delay = warmup;
        self.resume_delay = resume;
        self
    }

    pub async fn run_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            keepalive_secs = self.keepalive.as_secs(),
            "refresh scheduler started"
        );

        // A resume marker surviving a restart means the previous process
        // died between redirect and resume. Honor it once the freshly
        // loaded page has settled.
        match self.flags.take_resume_pending() {
            Ok(true) => {
                info!("resume marker found at startup");
                self.spawn_run("startup-resume", self.resume_delay);
            }
            Ok(false) => {}
            Err(err) => warn!("resume marker check failed: {err}"),
        }

        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let warmup = sleep(self.warmup_delay);
        tokio::pin!(warmup);
        let mut warmup_done = false;
        let mut commands_open = true;
        let mut loads_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("refresh scheduler stopped");
                    return;
                }
                _ = &mut warmup, if !warmup_done => {
                    warmup_done = true;
                    self.spawn_run("warmup", Duration::ZERO);
                }
                _ = keepalive.tick() => {
                    self.spawn_run("keepalive", Duration::ZERO);
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(ChannelMessage::RefreshToken) => {
                            self.spawn_run("backend", Duration::ZERO);
                        }
                        Some(other) => {
                            debug!(kind = other.kind(), "scheduler ignoring channel message");
                        }
                        None => {
                            debug!("command stream closed");
                            commands_open = false;
                        }
                    }
                }
                event = self.page_loads.recv(), if loads_open => {
                    match event {
                        Some(_) => self.handle_page_load(),
                        None => {
                            debug!("page load stream closed");
                            loads_open = false;
                        }
                    }
                }
            }
        }
    }

    /// A page load only matters when it follows a redirect this agent
    /// issued, which is what the resume marker records.
    fn handle_page_load(&self) {
        match self.flags.take_resume_pending() {
            Ok(true) => {
                info!("page reloaded with resume marker set");
                self.spawn_run("resume", self.resume_delay);
            }
            Ok(false) => debug!("page load without resume marker"),
            Err(err) => warn!("resume marker check failed: {err}"),
        }
    }

    fn spawn_run(&self, trigger: &'static str, delay: Duration) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            info!(trigger, "refresh triggered");
            match orchestrator.refresh().await {
                Ok(outcome) => info!(trigger, ?outcome, "refresh run finished"),
                Err(err) => warn!(trigger, "refresh run failed: {err}"),
            }
        });
    }
}
