use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use harvester_agent::{RefreshOrchestrator, RefreshScheduler};
use harvester_browser::{
    challenge_observer, BrowserSession, InstrumentEvent, InstrumentRegistry, Interceptor,
    StudioPage, TARGET_URL,
};
use harvester_channel::ChannelClient;
use harvester_core::{ChannelMessage, Config, Paths};
use harvester_storage::FlagStore;

const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Launch the browser, wire every component together and run until Ctrl+C.
pub async fn run(headless: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let mut config = Config::load_or_default(&paths)?;
    if headless {
        config.browser.headless = true;
    }
    let flags = FlagStore::new(paths.flags_file());

    // Browser first; nothing else is useful without it.
    let session = BrowserSession::launch(&config.browser, &paths).await?;
    let page = session.page();
    info!(port = session.devtools_port(), "browser up");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Backend channel.
    let (channel_client, channel_handle, commands_rx) = ChannelClient::new(
        config.channel.endpoint.clone(),
        Duration::from_secs(config.channel.reconnect_delay_secs),
    );
    let channel_task = tokio::spawn(channel_client.run_loop(shutdown_tx.subscribe()));

    // Page observers report through a binding; installed before the first
    // navigation so the initial document is already covered.
    let (instrument_tx, mut instrument_rx) = mpsc::unbounded_channel();
    let mut instruments = InstrumentRegistry::new(page.clone(), instrument_tx);
    instruments.register(challenge_observer());
    let instrument_pump = instruments.install().await?;

    // Request interception feeds harvested envelopes into the channel.
    let (envelope_tx, mut envelope_rx) = mpsc::unbounded_channel();
    let interceptor = Interceptor::new(page.clone(), session.user_agent(), envelope_tx);
    let intercept_pump = interceptor.install().await?;

    let envelope_handle = channel_handle.clone();
    let envelope_forwarder = tokio::spawn(async move {
        while let Some(data) = envelope_rx.recv().await {
            envelope_handle.send(ChannelMessage::CredentialsHarvested { data });
        }
    });

    let token_handle = channel_handle.clone();
    let token_forwarder = tokio::spawn(async move {
        while let Some(event) = instrument_rx.recv().await {
            match event {
                InstrumentEvent::ChallengeToken { token } => {
                    token_handle.send(ChannelMessage::TokenRefreshed { token });
                }
                InstrumentEvent::ChallengeExecution { site_key, .. } => {
                    debug!(?site_key, "challenge execution observed");
                }
            }
        }
    });

    // Subscribe before navigating so the scheduler sees the first load event.
    let page_loads = page.subscribe("Page.loadEventFired").await;

    let studio = Arc::new(StudioPage::new(page.clone()));
    let orchestrator = Arc::new(RefreshOrchestrator::new(
        studio,
        channel_handle.clone(),
        flags.clone(),
    ));

    info!(url = TARGET_URL, "navigating to the studio");
    if let Err(err) = session.navigate_and_wait(TARGET_URL, PAGE_LOAD_TIMEOUT).await {
        warn!("initial page load not confirmed: {err}");
    }

    let scheduler = RefreshScheduler::new(
        orchestrator,
        flags,
        Duration::from_secs(config.refresh.keepalive_minutes * 60),
        commands_rx,
        page_loads,
    );
    let scheduler_task = tokio::spawn(scheduler.run_loop(shutdown_tx.subscribe()));

    info!("agent ready");

    // ── Wait for shutdown signal ──
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining tasks...");

    let _ = shutdown_tx.send(());
    drop(channel_handle);

    let handles: Vec<(&str, tokio::task::JoinHandle<()>)> = vec![
        ("channel", channel_task),
        ("scheduler", scheduler_task),
    ];

    let deadline = tokio::time::Instant::now() + GRACEFUL_TIMEOUT;

    // Wait briefly for graceful shutdown.
    loop {
        if handles.iter().all(|(_, h)| h.is_finished()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Force-stop any stragglers so Ctrl+C returns quickly.
    for (name, handle) in &handles {
        if !handle.is_finished() {
            warn!(task = *name, "Task did not exit in graceful window, aborting");
            handle.abort();
        }
    }

    for (name, handle) in handles {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(task = name, "Task cancelled during shutdown");
            }
            Err(e) => {
                error!(task = name, error = %e, "Task panicked during shutdown");
            }
        }
    }

    // Event pumps have no draining to do.
    intercept_pump.abort();
    instrument_pump.abort();
    envelope_forwarder.abort();
    token_forwarder.abort();

    session.shutdown().await;
    info!("agent stopped");
    Ok(())
}
