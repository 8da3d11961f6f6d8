use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use harvester_channel::{ChannelClient, ChannelHandle};
use harvester_core::{ChannelMessage, CredentialEnvelope};

const WAIT: Duration = Duration::from_secs(5);
const RECONNECT: Duration = Duration::from_millis(50);

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_text(conn: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match timeout(WAIT, conn.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(_)) => continue,
            other => panic!("connection ended early: {other:?}"),
        }
    }
}

async fn wait_connected(handle: &ChannelHandle, want: bool) {
    timeout(WAIT, async {
        while handle.is_connected() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn identifies_on_every_connection() {
    let (listener, endpoint) = bind().await;
    let (client, _handle, _inbound) = ChannelClient::new(&endpoint, RECONNECT);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(client.run_loop(shutdown_rx));

    let mut conn = accept(&listener).await;
    let identify: serde_json::Value =
        serde_json::from_str(&next_text(&mut conn).await).unwrap();
    assert_eq!(identify["type"], "identify");
    assert_eq!(identify["client"], "harvester");
    drop(conn);

    // The client comes back on its own and identifies again.
    let mut conn = accept(&listener).await;
    let identify: serde_json::Value =
        serde_json::from_str(&next_text(&mut conn).await).unwrap();
    assert_eq!(identify["type"], "identify");
    assert_eq!(identify["client"], "harvester");

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn relays_outbound_and_dispatches_refresh_commands() {
    let (listener, endpoint) = bind().await;
    let (client, handle, mut inbound) = ChannelClient::new(&endpoint, RECONNECT);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(client.run_loop(shutdown_rx));

    let mut conn = accept(&listener).await;
    next_text(&mut conn).await;
    wait_connected(&handle, true).await;

    let envelope = CredentialEnvelope {
        url: "https://console.cloud.google.com/m/batchGraphql".into(),
        method: "POST".into(),
        headers: HashMap::from([("Cookie".to_string(), "SID=1".to_string())]),
        body: r#"[{"operationName":"generateContent"}]"#.into(),
    };
    handle.send(ChannelMessage::CredentialsHarvested { data: envelope });
    let relayed: serde_json::Value =
        serde_json::from_str(&next_text(&mut conn).await).unwrap();
    assert_eq!(relayed["type"], "credentials_harvested");
    assert_eq!(relayed["data"]["method"], "POST");
    assert_eq!(relayed["data"]["headers"]["Cookie"], "SID=1");

    // Noise is absorbed without disturbing the connection.
    conn.send(Message::Text("not json at all".into())).await.unwrap();
    conn.send(Message::Text(r#"{"type":"mystery","x":1}"#.into())).await.unwrap();
    conn.send(Message::Text(r#"{"type":"refresh_token"}"#.into())).await.unwrap();

    let command = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
    assert!(matches!(command, ChannelMessage::RefreshToken));
    assert!(inbound.try_recv().is_err());

    // Still connected after the noise.
    handle.send(ChannelMessage::RefreshComplete);
    let done: serde_json::Value = serde_json::from_str(&next_text(&mut conn).await).unwrap();
    assert_eq!(done["type"], "refresh_complete");

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn messages_offered_while_down_are_never_delivered() {
    let (listener, endpoint) = bind().await;
    let (client, handle, _inbound) = ChannelClient::new(&endpoint, RECONNECT);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(client.run_loop(shutdown_rx));

    let conn = accept(&listener).await;
    wait_connected(&handle, true).await;
    drop(conn);
    wait_connected(&handle, false).await;

    // Offered while down: dropped, not queued.
    handle.send(ChannelMessage::RefreshComplete);

    let mut conn = accept(&listener).await;
    let identify = next_text(&mut conn).await;
    assert!(identify.contains("identify"));
    wait_connected(&handle, true).await;
    handle.send(ChannelMessage::TokenRefreshed { token: "tok".into() });

    // First frame after identify is the post-reconnect message; the one
    // offered while down never shows up.
    let first: serde_json::Value = serde_json::from_str(&next_text(&mut conn).await).unwrap();
    assert_eq!(first["type"], "token_refreshed");

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_endpoint_stops_without_retrying() {
    let (client, _handle, _inbound) =
        ChannelClient::new("http://127.0.0.1:1/ws", Duration::from_millis(10));
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    timeout(Duration::from_secs(1), client.run_loop(shutdown_rx))
        .await
        .expect("wrong-scheme endpoint must fail fast");

    let (client, _handle, _inbound) =
        ChannelClient::new("not a url", Duration::from_millis(10));
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    timeout(Duration::from_secs(1), client.run_loop(shutdown_rx))
        .await
        .expect("unparseable endpoint must fail fast");
}
