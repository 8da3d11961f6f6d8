//! Persistent channel to the backend. One WebSocket connection at a time,
//! re-established on a fixed cadence after any failure; each connection
//! opens by identifying this agent.
//!
//! Delivery is at-most-once by design: messages offered while the channel
//! is down are dropped, not queued, and anything still queued when a
//! connection dies is discarded. The backend treats every envelope as a
//! refresh of the same state, so replaying stale ones has no value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use harvester_core::{ChannelMessage, Error, Result};

/// Sender half of the channel, cheap to clone and hand out.
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    connected: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Offer a message to the backend. While the channel is down the
    /// message is dropped with a log line; nothing is queued for later.
    pub fn send(&self, message: ChannelMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            debug!(kind = message.kind(), "channel closed, dropping message");
            return;
        }
        if self.outbound.send(message).is_err() {
            debug!("channel client stopped, dropping message");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Handle wired straight to a receiver with no socket behind it, always
    /// reported open. For tests and local wiring.
    pub fn open_pair() -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            outbound: tx,
            connected: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }
}

/// Owns the WebSocket connection and its reconnect loop.
pub struct ChannelClient {
    endpoint: String,
    reconnect_delay: Duration,
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    inbound: mpsc::UnboundedSender<ChannelMessage>,
}

impl ChannelClient {
    /// Build a client plus the handle used to send through it and the
    /// receiver on which backend commands arrive.
    pub fn new(
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, ChannelHandle, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let client = Self {
            endpoint: endpoint.into(),
            reconnect_delay,
            connected: connected.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        let handle = ChannelHandle {
            outbound: outbound_tx,
            connected,
        };
        (client, handle, inbound_rx)
    }

    /// Connect and keep reconnecting until shutdown. A malformed endpoint
    /// is a configuration error, not an outage: it is reported once and
    /// the loop never starts.
    pub async fn run_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(err) = validate_endpoint(&self.endpoint) {
            error!("{err}");
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("channel client shutting down");
                    return;
                }
                result = self.connect_and_run() => {
                    match result {
                        Ok(()) => {
                            info!("channel handle dropped, stopping client");
                            return;
                        }
                        Err(err) => {
                            warn!("channel connection lost: {err}");
                        }
                    }
                }
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("channel client shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        let (stream, _) = connect_async(&self.endpoint)
            .await
            .map_err(|e| Error::Channel(format!("connect {}: {e}", self.endpoint)))?;
        let (mut sink, mut source) = stream.split();

        let identify = serde_json::to_string(&ChannelMessage::identify())?;
        sink.send(Message::Text(identify))
            .await
            .map_err(|e| Error::Channel(format!("identify: {e}")))?;
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "channel connected");

        let result = loop {
            tokio::select! {
                queued = self.outbound.recv() => {
                    let Some(message) = queued else {
                        break Ok(());
                    };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("unserializable channel message: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        break Err(Error::Channel(format!("send: {err}")));
                    }
                    debug!(kind = message.kind(), "message relayed to backend");
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch_frame(&text),
                        Some(Ok(Message::Close(_))) => {
                            break Err(Error::Channel("closed by backend".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            break Err(Error::Channel(format!("read: {err}")));
                        }
                        None => break Err(Error::Channel("connection ended".into())),
                    }
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        // Whatever was queued for the dead connection is now stale.
        let mut discarded = 0usize;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded messages queued for a dead connection");
        }
        result
    }

    fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<ChannelMessage>(text) {
            Ok(ChannelMessage::RefreshToken) => {
                info!("backend requested a session refresh");
                if self.inbound.send(ChannelMessage::RefreshToken).is_err() {
                    debug!("command receiver gone, dropping refresh request");
                }
            }
            Ok(other) => {
                debug!(kind = other.kind(), "ignoring channel message");
            }
            Err(err) => {
                debug!("discarding unparseable channel frame: {err}");
            }
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Channel(format!("invalid channel endpoint {endpoint}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(Error::Channel(format!(
            "channel endpoint {endpoint}: scheme {other} is not ws or wss"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_schemes() {
        assert!(validate_endpoint("ws://127.0.0.1:28880/ws").is_ok());
        assert!(validate_endpoint("wss://relay.example.com/ws").is_ok());
        assert!(validate_endpoint("http://127.0.0.1:8080/ws").is_err());
        assert!(validate_endpoint("not a url").is_err());
    }

    #[test]
    fn open_pair_delivers_immediately() {
        let (handle, mut rx) = ChannelHandle::open_pair();
        assert!(handle.is_connected());
        handle.send(ChannelMessage::RefreshComplete);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind(), "refresh_complete");
    }
}
