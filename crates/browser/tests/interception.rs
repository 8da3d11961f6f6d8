use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use harvester_browser::{CdpClient, Interceptor};
use harvester_core::CredentialEnvelope;

const WAIT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64)";

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/devtools/page/test", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_command(conn: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match timeout(WAIT, conn.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("devtools connection ended early: {other:?}"),
        }
    }
}

async fn respond(conn: &mut WebSocketStream<TcpStream>, command: &Value, result: Value) {
    let reply = json!({ "id": command["id"], "result": result });
    conn.send(Message::Text(reply.to_string())).await.unwrap();
}

async fn respond_err(conn: &mut WebSocketStream<TcpStream>, command: &Value, message: &str) {
    let reply = json!({ "id": command["id"], "error": { "message": message } });
    conn.send(Message::Text(reply.to_string())).await.unwrap();
}

async fn send_event(conn: &mut WebSocketStream<TcpStream>, method: &str, params: Value) {
    let frame = json!({ "method": method, "params": params });
    conn.send(Message::Text(frame.to_string())).await.unwrap();
}

/// No further frames arrive within a grace window.
async fn assert_quiet(conn: &mut WebSocketStream<TcpStream>) {
    if let Ok(frame) = timeout(Duration::from_millis(200), conn.next()).await {
        panic!("unexpected devtools traffic: {frame:?}");
    }
}

/// Connect a client to an in-process DevTools endpoint and install the
/// interceptor, answering the Fetch.enable handshake.
async fn install_interceptor() -> (
    WebSocketStream<TcpStream>,
    mpsc::UnboundedReceiver<CredentialEnvelope>,
    JoinHandle<()>,
) {
    let (listener, endpoint) = bind().await;
    let (client, mut conn) = tokio::join!(CdpClient::connect(&endpoint), accept(&listener));
    let cdp = Arc::new(client.unwrap());

    let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
    let interceptor = Interceptor::new(cdp, USER_AGENT, envelope_tx);

    let (task, _) = tokio::join!(interceptor.install(), async {
        let enable = next_command(&mut conn).await;
        assert_eq!(enable["method"], "Fetch.enable");
        assert_eq!(enable["params"]["patterns"][0]["urlPattern"], "*");
        respond(&mut conn, &enable, json!({})).await;
    });
    (conn, envelope_rx, task.unwrap())
}

#[tokio::test]
async fn every_pause_is_released_exactly_once_and_only_model_calls_captured() {
    let (mut conn, mut envelopes, task) = install_interceptor().await;

    // An event with no request id cannot be released; it must not wedge
    // the stream.
    send_event(&mut conn, "Fetch.requestPaused", json!({"frameId": "f-0"})).await;

    // Console housekeeping traffic: released, never captured.
    send_event(
        &mut conn,
        "Fetch.requestPaused",
        json!({
            "requestId": "pause-1",
            "request": {
                "url": "https://console.cloud.google.com/m/batchGraphql",
                "method": "POST",
                "headers": {"Content-Type": "application/json"},
                "postData": r#"[{"operationName":"ListBillingAccounts"}]"#,
            },
        }),
    )
    .await;
    let release = next_command(&mut conn).await;
    assert_eq!(release["method"], "Fetch.continueRequest");
    assert_eq!(release["params"]["requestId"], "pause-1");
    respond(&mut conn, &release, json!({})).await;

    // A model call: released first, harvested after.
    send_event(
        &mut conn,
        "Fetch.requestPaused",
        json!({
            "requestId": "pause-2",
            "request": {
                "url": "https://console.cloud.google.com/m/batchGraphql?prettyPrint=false",
                "method": "POST",
                "headers": {"Content-Type": "application/json"},
                "postData": r#"[{"operationName":"generateContent","variables":{}}]"#,
            },
        }),
    )
    .await;

    let release = next_command(&mut conn).await;
    assert_eq!(release["method"], "Fetch.continueRequest");
    assert_eq!(release["params"]["requestId"], "pause-2");
    // Harvesting cannot have started: the release reply is still pending.
    assert!(envelopes.try_recv().is_err());
    respond(&mut conn, &release, json!({})).await;

    let cookies = next_command(&mut conn).await;
    assert_eq!(cookies["method"], "Network.getCookies");
    respond(
        &mut conn,
        &cookies,
        json!({"cookies": [
            {"name": "SID", "value": "abc"},
            {"name": "HSID", "value": "def"},
        ]}),
    )
    .await;

    let location = next_command(&mut conn).await;
    assert_eq!(location["method"], "Runtime.evaluate");
    respond(
        &mut conn,
        &location,
        json!({"result": {
            "type": "string",
            "value": "https://console.cloud.google.com/vertex-ai/studio/multimodal",
        }}),
    )
    .await;

    let envelope = timeout(WAIT, envelopes.recv()).await.unwrap().unwrap();
    assert!(envelope.url.contains("batchGraphql"));
    assert_eq!(envelope.method, "POST");
    assert_eq!(envelope.headers["Cookie"], "SID=abc; HSID=def");
    assert_eq!(envelope.headers["User-Agent"], USER_AGENT);
    assert_eq!(envelope.headers["Content-Type"], "application/json");
    assert_eq!(envelope.headers["Origin"], "https://console.cloud.google.com");
    assert_eq!(
        envelope.headers["Referer"],
        "https://console.cloud.google.com/vertex-ai/studio/multimodal"
    );
    assert!(envelope.body.contains("generateContent"));

    // Two pauses, two releases, one envelope. Nothing else moves.
    assert!(envelopes.try_recv().is_err());
    assert_quiet(&mut conn).await;
    task.abort();
}

#[tokio::test]
async fn ambient_lookup_failures_never_block_the_envelope() {
    let (mut conn, mut envelopes, task) = install_interceptor().await;

    send_event(
        &mut conn,
        "Fetch.requestPaused",
        json!({
            "requestId": "pause-1",
            "request": {
                "url": "https://console.cloud.google.com/m/batchGraphql",
                "method": "POST",
                "headers": {},
                "postData": r#"[{"operationName":"Predict"}]"#,
            },
        }),
    )
    .await;

    let release = next_command(&mut conn).await;
    assert_eq!(release["method"], "Fetch.continueRequest");
    respond(&mut conn, &release, json!({})).await;

    let cookies = next_command(&mut conn).await;
    assert_eq!(cookies["method"], "Network.getCookies");
    respond_err(&mut conn, &cookies, "no cookie store").await;

    let location = next_command(&mut conn).await;
    assert_eq!(location["method"], "Runtime.evaluate");
    respond_err(&mut conn, &location, "execution context destroyed").await;

    let envelope = timeout(WAIT, envelopes.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.method, "POST");
    assert_eq!(envelope.headers["User-Agent"], USER_AGENT);
    assert!(!envelope.headers.contains_key("Cookie"));
    assert!(!envelope.headers.contains_key("Origin"));
    assert!(!envelope.headers.contains_key("Referer"));
    task.abort();
}

#[tokio::test]
async fn page_supplied_headers_suppress_ambient_lookups() {
    let (mut conn, mut envelopes, task) = install_interceptor().await;

    send_event(
        &mut conn,
        "Fetch.requestPaused",
        json!({
            "requestId": "pause-1",
            "request": {
                "url": "https://console.cloud.google.com/m/batchGraphql",
                "method": "POST",
                "headers": {
                    "cookie": "SID=page",
                    "origin": "https://console.cloud.google.com",
                    "referer": "https://console.cloud.google.com/vertex-ai/studio",
                },
                "postData": r#"[{"operationName":"GenerateImage"}]"#,
            },
        }),
    )
    .await;

    let release = next_command(&mut conn).await;
    assert_eq!(release["method"], "Fetch.continueRequest");
    respond(&mut conn, &release, json!({})).await;

    // The envelope arrives without any cookie or location round trip; the
    // page's own header spellings survive untouched.
    let envelope = timeout(WAIT, envelopes.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.headers["cookie"], "SID=page");
    assert_eq!(envelope.headers["User-Agent"], USER_AGENT);
    assert!(!envelope.headers.contains_key("Cookie"));
    assert_quiet(&mut conn).await;
    task.abort();
}
