// Push-socket tests against an in-process mock controller.
//
// The mock speaks just enough of the stream protocol to exercise the
// client: it sends the SessionStarted handshake, answers correlated
// requests, and can be told to inject push frames. Login goes through
// wiremock like the HTTP tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use centra_api::transport::TransportConfig;
use centra_api::wire::Request;
use centra_api::{Credentials, Error, LinkState, SessionManager, SocketClient, SocketConfig};

// ── Mock controller ─────────────────────────────────────────────────

struct MockController {
    addr: SocketAddr,
    /// Every request envelope any connection received, in order.
    seen: mpsc::UnboundedReceiver<Request>,
    /// Raw frames to inject into the currently open connection.
    inject: broadcast::Sender<String>,
}

async fn spawn_controller(keepalive_secs: u64) -> MockController {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (inject, _) = broadcast::channel(16);
    let inject_handle: broadcast::Sender<String> = inject.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };

            let mut inject_rx = inject_handle.subscribe();

            let handshake = json!({
                "operationName": "SessionStarted",
                "sequenceId": 0,
                "result": { "keepaliveSecs": keepalive_secs }
            });
            if ws.send(Message::Text(handshake.to_string().into())).await.is_err() {
                continue;
            }
            loop {
                tokio::select! {
                    frame = inject_rx.recv() => {
                        let Ok(frame) = frame else { break };
                        if ws.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(req) = serde_json::from_str::<Request>(text.as_str()) else {
                                    continue;
                                };
                                let reply = json!({
                                    "sequenceId": req.sequence_id,
                                    "operationName": req.operation_name,
                                    "result": "ok"
                                });
                                let notify = req.operation_name == "ClientReady";
                                let _ = seen_tx.send(req);
                                if !notify
                                    && ws.send(Message::Text(reply.to_string().into())).await.is_err()
                                {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            _ => {}
                        }
                    }
                }
            }
        }
    });

    MockController { addr, seen, inject }
}

async fn setup_client(controller_addr: SocketAddr) -> (MockServer, SocketClient) {
    let login = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "token": "tok-1", "validUntilSecs": 900 })),
        )
        .mount(&login)
        .await;

    let base: Url = login.uri().parse().expect("login URI");
    let credentials = Credentials {
        username: "svc-core".into(),
        password: secrecy::SecretString::from("hunter2".to_owned()),
    };
    let session = Arc::new(
        SessionManager::new(&base, credentials, &TransportConfig::default())
            .expect("session manager"),
    );

    let url: Url = format!("ws://{controller_addr}/api/v1/stream")
        .parse()
        .expect("stream URL");
    let config = SocketConfig {
        url,
        connect_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(5),
    };

    (login, SocketClient::new(config, session))
}

/// Drain every request the controller has seen so far.
fn drain_seen(controller: &mut MockController) -> Vec<Request> {
    let mut seen = Vec::new();
    while let Ok(req) = controller.seen.try_recv() {
        seen.push(req);
    }
    seen
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_completes_handshake() {
    let mut controller = spawn_controller(60).await;
    let (_login, client) = setup_client(controller.addr).await;

    client.connect().await.expect("connect");
    assert!(client.is_connected());

    // Empty registry: the resubscription pass must issue zero requests.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain_seen(&mut controller).is_empty());

    client.disconnect().await;
}

#[tokio::test]
async fn call_resolves_with_correlated_response() {
    let controller = spawn_controller(60).await;
    let (_login, client) = setup_client(controller.addr).await;

    client.connect().await.expect("connect");
    let result = client
        .call("GetInstances", vec![json!("light")])
        .await
        .expect("call");
    assert_eq!(result, json!("ok"));

    client.disconnect().await;
}

#[tokio::test]
async fn sequence_counter_resets_on_reconnect() {
    let mut controller = spawn_controller(60).await;
    let (_login, client) = setup_client(controller.addr).await;

    client.connect().await.expect("first connect");
    client.call("GetInstances", vec![json!("light")]).await.expect("call 1");
    client.call("GetInstances", vec![json!("cover")]).await.expect("call 2");
    client.disconnect().await;

    client.connect().await.expect("second connect");
    client.call("GetInstances", vec![json!("light")]).await.expect("call 3");
    client.disconnect().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seqs: Vec<u64> = drain_seen(&mut controller)
        .iter()
        .map(|r| r.sequence_id)
        .collect();
    assert_eq!(seqs, [1, 2, 1], "sequence counter must restart per session");
}

#[tokio::test]
async fn connect_replays_registry_in_one_batched_request() {
    let mut controller = spawn_controller(60).await;
    let (_login, client) = setup_client(controller.addr).await;

    // Registered while offline: recorded, no wire traffic yet.
    client
        .subscribe("L1", &["brightness".into(), "on".into()])
        .await
        .expect("subscribe L1");
    client
        .subscribe("C7", &["position".into()])
        .await
        .expect("subscribe C7");

    client.connect().await.expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = drain_seen(&mut controller);
    let registers: Vec<&Request> = seen
        .iter()
        .filter(|r| r.operation_name == "RegisterValueObservers")
        .collect();
    assert_eq!(registers.len(), 1, "expected exactly one batched replay");

    let specs = registers[0].args[0].as_array().expect("observer list");
    let mut ids: Vec<&str> = specs
        .iter()
        .map(|s| s["instanceId"].as_str().expect("instanceId"))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, ["C7", "L1"]);

    client.disconnect().await;
}

#[tokio::test]
async fn push_frames_reach_the_event_queue() {
    let controller = spawn_controller(60).await;
    let (_login, client) = setup_client(controller.addr).await;

    let mut events = client.push_events().await.expect("event queue");
    client.connect().await.expect("connect");

    let frame = json!({
        "operationName": "ValuesChanged",
        "table": {
            "floor1.L1.brightness": { "value": 75, "reason": "user" },
            "brokenkey": { "value": 0 }
        }
    });
    controller.inject.send(frame.to_string()).expect("inject");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event");
    assert_eq!(event.instance_id, "floor1.L1");
    assert_eq!(event.changes["brightness"].value, json!(75));

    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_aborts_inflight_connect() {
    // A listener that accepts TCP but never answers the upgrade: the
    // connect attempt hangs until aborted.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _held = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let (_login, client) = setup_client(addr).await;

    let connector = client.clone();
    let pending = tokio::spawn(async move { connector.connect().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    client.disconnect().await;
    let result = pending.await.expect("join");

    assert!(
        matches!(result, Err(Error::ConnectAborted)),
        "expected ConnectAborted, got: {result:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "aborted connect must reject promptly, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn idle_watchdog_tears_down_silent_connection() {
    // keepalive of 1s and a controller that goes silent after the
    // handshake: the watchdog should fire after ~4s.
    let controller = spawn_controller(1).await;
    let (_login, client) = setup_client(controller.addr).await;

    client.connect().await.expect("connect");
    let mut state = client.link_state();

    let lost = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == LinkState::Disconnected),
    )
    .await;
    assert!(lost.is_ok(), "watchdog did not tear down the connection");
}
