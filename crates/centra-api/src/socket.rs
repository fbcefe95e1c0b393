//! Push-channel socket client.
//!
//! Owns one persistent WebSocket session to the controller's stream
//! endpoint: handshake, sequence-id-correlated request/response, the
//! subscription registry with replay after reconnect, an idle watchdog,
//! and clean abort semantics. Incremental `ValuesChanged` deltas are
//! parsed off the wire and handed to a single-consumer event queue;
//! consumers never touch the socket directly.
//!
//! The client deliberately does **not** reconnect on its own. Connection
//! loss is observable through [`SocketClient::link_state`]; the caller
//! owns retry timing and backoff and simply calls
//! [`connect`](SocketClient::connect) again. Each successful connect
//! starts a fresh session: sequence counter back to 1, pending requests
//! empty, subscriptions replayed from the registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::session::SessionManager;
use crate::wire::{self, Inbound, ObserverSpec, PushValue, Request};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;
type WsSource = SplitStream<WsStream>;

// ── Tuning ───────────────────────────────────────────────────────────

const EVENT_QUEUE_CAPACITY: usize = 1024;
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// The watchdog fires after this many missed keepalive intervals.
///
/// Generous on purpose: a tight threshold tears down genuinely idle
/// connections, and every spurious teardown feeds a reconnection storm.
const IDLE_MULTIPLIER: u32 = 4;

/// Keepalive interval assumed when the handshake does not report one.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

// ── Public types ─────────────────────────────────────────────────────

/// Observable lifecycle state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// One batch of property deltas for a single instance, in server
/// emission order.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub instance_id: String,
    pub changes: IndexMap<String, PushValue>,
}

/// Connection settings for the push socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: Url,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl SocketConfig {
    /// Derive the stream URL from the controller base URL.
    pub fn for_controller(base_url: &Url) -> Result<Self, Error> {
        let mut url = base_url
            .join("/api/v1/stream")
            .map_err(Error::InvalidUrl)?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::SocketConnect(format!(
                    "cannot derive stream URL from scheme {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::SocketConnect("cannot derive stream URL scheme".into()))?;

        Ok(Self {
            url,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
        })
    }
}

// ── Internal state ───────────────────────────────────────────────────

/// One transport session. Destroyed and replaced wholesale on reconnect;
/// only the subscription registry, which lives above the connection,
/// survives.
struct Connection {
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, Error>>>>,
    outbound: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
    idle_limit: Duration,
}

enum Link {
    Disconnected,
    Connecting { cancel: CancellationToken },
    Connected(Arc<Connection>),
}

struct Shared {
    config: SocketConfig,
    session: Arc<SessionManager>,
    link: Mutex<Link>,
    state_tx: watch::Sender<LinkState>,
    registry: Mutex<HashMap<String, BTreeSet<String>>>,
    event_tx: mpsc::Sender<PushEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PushEvent>>>,
}

// ── SocketClient ─────────────────────────────────────────────────────

/// Client for the controller's push channel.
///
/// Cheaply cloneable; all clones share one connection, registry, and
/// event queue.
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<Shared>,
}

impl SocketClient {
    pub fn new(config: SocketConfig, session: Arc<SessionManager>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Self {
            inner: Arc::new(Shared {
                config,
                session,
                link: Mutex::new(Link::Disconnected),
                state_tx,
                registry: Mutex::new(HashMap::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the push-event queue. Single consumer; returns `None` on
    /// every call after the first.
    pub async fn push_events(&self) -> Option<mpsc::Receiver<PushEvent>> {
        self.inner.event_rx.lock().await.take()
    }

    /// Subscribe to lifecycle state changes.
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == LinkState::Connected
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect to the push channel.
    ///
    /// Idempotent: while already connected this is a no-op, and a call
    /// racing an in-flight attempt awaits that attempt's outcome instead
    /// of opening a second socket. Resolves as connected only after the
    /// server's `SessionStarted` handshake; every success starts a fresh
    /// session (sequence counter at 1) and replays the subscription
    /// registry in one batched request.
    pub async fn connect(&self) -> Result<(), Error> {
        let cancel = {
            let mut link = self.inner.link.lock().await;
            match &*link {
                Link::Connected(_) => return Ok(()),
                Link::Connecting { .. } => {
                    drop(link);
                    return self.await_inflight().await;
                }
                Link::Disconnected => {
                    let cancel = CancellationToken::new();
                    *link = Link::Connecting {
                        cancel: cancel.clone(),
                    };
                    let _ = self.inner.state_tx.send(LinkState::Connecting);
                    cancel
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::ConnectAborted),
            r = self.establish() => r,
        };

        match result {
            Ok(conn) => {
                {
                    let mut link = self.inner.link.lock().await;
                    if cancel.is_cancelled() {
                        // disconnect() won the race; never resolve as
                        // connected, and leave any newer attempt's state
                        // alone.
                        conn.cancel.cancel();
                        if matches!(&*link, Link::Disconnected) {
                            let _ = self.inner.state_tx.send(LinkState::Disconnected);
                        }
                        return Err(Error::ConnectAborted);
                    }
                    if conn.cancel.is_cancelled() {
                        // The read loop already tore this connection down
                        // (socket error right after the handshake).
                        *link = Link::Disconnected;
                        let _ = self.inner.state_tx.send(LinkState::Disconnected);
                        return Err(Error::SocketConnect(
                            "connection lost during setup".into(),
                        ));
                    }
                    *link = Link::Connected(Arc::clone(&conn));
                }

                let _ = self.inner.state_tx.send(LinkState::Connected);
                info!("push socket connected");

                if let Err(e) = self.resubscribe_all().await {
                    warn!(error = %e, "subscription replay failed");
                }
                Ok(())
            }
            Err(e) => {
                let mut link = self.inner.link.lock().await;
                if !cancel.is_cancelled() && matches!(&*link, Link::Connecting { .. }) {
                    // This failed attempt still owns the slot
                    *link = Link::Disconnected;
                    let _ = self.inner.state_tx.send(LinkState::Disconnected);
                } else if matches!(&*link, Link::Disconnected) {
                    // Aborted by disconnect() with no newer attempt yet:
                    // publish the state so in-flight waiters wake up
                    let _ = self.inner.state_tx.send(LinkState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Close the push channel.
    ///
    /// Called while connecting, the in-flight attempt is aborted and its
    /// future rejects promptly. Called while connected, the socket is
    /// closed and every pending request rejects with
    /// [`Error::ConnectionClosed`]. The subscription registry is kept --
    /// it is cleared only by explicit unsubscribes.
    pub async fn disconnect(&self) {
        let previous = {
            let mut link = self.inner.link.lock().await;
            std::mem::replace(&mut *link, Link::Disconnected)
        };

        match previous {
            Link::Disconnected => {}
            Link::Connecting { cancel } => {
                debug!("aborting in-flight connect");
                cancel.cancel();
                // connect() observes the cancellation and publishes the
                // Disconnected state itself
            }
            Link::Connected(conn) => {
                conn.cancel.cancel();
                reject_pending(&conn).await;
                let _ = self.inner.state_tx.send(LinkState::Disconnected);
                info!("push socket disconnected");
            }
        }
    }

    // ── Correlated calls ─────────────────────────────────────────

    /// Send one operation over the push channel and await its response.
    ///
    /// Allocates the next sequence id of the current connection and
    /// registers a pending request with its own timeout. Operations on
    /// the notify allowlist ([`wire::NOTIFY_OPERATIONS`]) are sent and
    /// resolved immediately -- the server never answers them.
    pub async fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value, Error> {
        let conn = self.current_connection().await?;
        let seq = conn.seq.fetch_add(1, Ordering::Relaxed);

        let envelope = Request {
            args,
            operation_name: operation.to_owned(),
            sequence_id: seq,
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| Error::Protocol(format!("failed to encode request: {e}")))?;

        if wire::NOTIFY_OPERATIONS.contains(&operation) {
            conn.outbound
                .send(tungstenite::Message::Text(text.into()))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            return Ok(Value::Null);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        conn.pending.lock().await.insert(seq, reply_tx);

        if conn
            .outbound
            .send(tungstenite::Message::Text(text.into()))
            .await
            .is_err()
        {
            conn.pending.lock().await.remove(&seq);
            return Err(Error::ConnectionClosed);
        }

        match tokio::time::timeout(self.inner.config.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the connection was torn down underneath us
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                conn.pending.lock().await.remove(&seq);
                Err(Error::Timeout {
                    operation: operation.to_owned(),
                    timeout_secs: self.inner.config.call_timeout.as_secs(),
                })
            }
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Add or extend one subscription.
    pub async fn subscribe(&self, instance_id: &str, properties: &[String]) -> Result<(), Error> {
        self.subscribe_batch(&[(instance_id.to_owned(), properties.to_vec())])
            .await
    }

    /// Add or extend several subscriptions with a single
    /// register-and-subscribe request.
    ///
    /// The registry survives disconnects; entries added while offline
    /// are replayed automatically on the next successful connect.
    pub async fn subscribe_batch(&self, entries: &[(String, Vec<String>)]) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }

        {
            let mut registry = self.inner.registry.lock().await;
            for (instance_id, properties) in entries {
                registry
                    .entry(instance_id.clone())
                    .or_default()
                    .extend(properties.iter().cloned());
            }
        }

        if !self.is_connected() {
            return Ok(());
        }

        let specs: Vec<ObserverSpec> = entries
            .iter()
            .map(|(instance_id, properties)| ObserverSpec {
                instance_id: instance_id.clone(),
                properties: properties.clone(),
            })
            .collect();
        self.register_observers(specs).await
    }

    /// Remove one subscription. The server-side observer lapses with the
    /// session; it is simply not replayed on the next connect.
    pub async fn unsubscribe(&self, instance_id: &str) {
        self.inner.registry.lock().await.remove(instance_id);
    }

    /// Replay the full registry after a successful connect.
    async fn resubscribe_all(&self) -> Result<(), Error> {
        // Defensive copy: a concurrent subscribe during the await below
        // must not invalidate this iteration.
        let specs: Vec<ObserverSpec> = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .map(|(instance_id, properties)| ObserverSpec {
                    instance_id: instance_id.clone(),
                    properties: properties.iter().cloned().collect(),
                })
                .collect()
        };

        if specs.is_empty() {
            return Ok(());
        }

        debug!(instances = specs.len(), "replaying subscriptions");
        self.register_observers(specs).await
    }

    async fn register_observers(&self, specs: Vec<ObserverSpec>) -> Result<(), Error> {
        let payload = serde_json::to_value(specs)
            .map_err(|e| Error::Protocol(format!("failed to encode observer specs: {e}")))?;
        self.call(wire::OP_REGISTER_OBSERVERS, vec![payload])
            .await
            .map(drop)
    }

    // ── Internals ────────────────────────────────────────────────

    /// A second `connect()` racing an in-flight attempt parks here until
    /// that attempt settles.
    async fn await_inflight(&self) -> Result<(), Error> {
        debug!("connect already in flight, awaiting its outcome");
        let mut rx = self.inner.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| *s != LinkState::Connecting)
            .await
            .map_err(|_| Error::ConnectAborted)?;

        match state {
            LinkState::Connected => Ok(()),
            _ => Err(Error::SocketConnect(
                "concurrent connect attempt failed".into(),
            )),
        }
    }

    async fn current_connection(&self) -> Result<Arc<Connection>, Error> {
        match &*self.inner.link.lock().await {
            Link::Connected(conn) => Ok(Arc::clone(conn)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Open the socket, complete the handshake, spawn the read/write
    /// loops. Returns the fresh connection; the caller installs it.
    async fn establish(&self) -> Result<Arc<Connection>, Error> {
        let shared = &self.inner;
        let token = shared.session.get_token().await?;

        let uri: tungstenite::http::Uri = shared
            .config
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::SocketConnect(e.to_string()))?;
        let request = ClientRequestBuilder::new(uri)
            .with_header("Authorization", format!("Bearer {}", token.expose_secret()));

        info!(url = %shared.config.url, "connecting to push socket");

        let (ws, _response) = tokio::time::timeout(
            shared.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::SocketConnect("connect timed out".into()))?
        .map_err(|e| Error::SocketConnect(e.to_string()))?;

        let (sink, mut source) = ws.split();

        // The server speaks first: nothing is Connected until the
        // SessionStarted handshake arrives.
        let keepalive_secs =
            wait_for_handshake(&mut source, shared.config.connect_timeout).await?;
        let keepalive = if keepalive_secs == 0 {
            DEFAULT_KEEPALIVE
        } else {
            Duration::from_secs(keepalive_secs)
        };

        debug!(keepalive_secs = keepalive.as_secs(), "handshake complete");

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let conn = Arc::new(Connection {
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            cancel: cancel.clone(),
            idle_limit: keepalive.saturating_mul(IDLE_MULTIPLIER),
        });

        tokio::spawn(write_loop(sink, outbound_rx, cancel));
        tokio::spawn(read_loop(Arc::clone(shared), Arc::clone(&conn), source));

        Ok(conn)
    }
}

// ── Connection tasks ─────────────────────────────────────────────────

async fn wait_for_handshake(source: &mut WsSource, timeout: Duration) -> Result<u64, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, source.next())
            .await
            .map_err(|_| Error::SocketConnect("no handshake before timeout".into()))?;

        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => match wire::parse_inbound(&text) {
                Ok(Inbound::SessionStarted { keepalive_secs }) => return Ok(keepalive_secs),
                Ok(other) => debug!(?other, "ignoring pre-handshake frame"),
                Err(e) => {
                    return Err(Error::Protocol(format!("malformed handshake frame: {e}")));
                }
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::SocketConnect(e.to_string())),
            None => return Err(Error::SocketConnect("socket closed during handshake".into())),
        }
    }
}

/// Drain the outbound queue into the socket until cancelled.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(tungstenite::Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
        }
    }
}

/// Read frames until cancellation, socket loss, or watchdog expiry.
async fn read_loop(shared: Arc<Shared>, conn: Arc<Connection>, mut source: WsSource) {
    let mut deadline = Instant::now() + conn.idle_limit;

    let lost = loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break false,
            () = tokio::time::sleep_until(deadline) => {
                warn!(
                    idle_secs = conn.idle_limit.as_secs(),
                    "no inbound traffic within watchdog window, tearing down connection"
                );
                break true;
            }
            frame = source.next() => {
                // Any inbound traffic, keepalives included, feeds the watchdog
                deadline = Instant::now() + conn.idle_limit;
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        handle_frame(&shared, &conn, &text).await;
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers pongs automatically
                        tracing::trace!("socket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        info!(?frame, "close frame received");
                        break true;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "socket read error");
                        break true;
                    }
                    None => {
                        info!("socket stream ended");
                        break true;
                    }
                    _ => {}
                }
            }
        }
    };

    if lost {
        conn.cancel.cancel();
        reject_pending(&conn).await;

        // Report the loss only if this connection is still the current
        // one; a reconnect may already have replaced it.
        let mut link = shared.link.lock().await;
        if let Link::Connected(current) = &*link {
            if Arc::ptr_eq(current, &conn) {
                *link = Link::Disconnected;
                let _ = shared.state_tx.send(LinkState::Disconnected);
            }
        }
    }
}

async fn handle_frame(shared: &Shared, conn: &Connection, text: &str) {
    match wire::parse_inbound(text) {
        Ok(Inbound::Response(resp)) => {
            let waiter = conn.pending.lock().await.remove(&resp.sequence_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(resp.result));
                }
                None => debug!(
                    seq = resp.sequence_id,
                    operation = %resp.operation_name,
                    "response with no pending request"
                ),
            }
        }
        Ok(Inbound::ValuesChanged(table)) => dispatch_values(&shared.event_tx, table).await,
        Ok(Inbound::KeepAlive) => tracing::trace!("keepalive"),
        Ok(Inbound::SessionStarted { .. }) => {
            debug!("unexpected SessionStarted after handshake");
        }
        Err(e) => warn!(error = %e, "dropping malformed inbound frame"),
    }
}

/// Split composite keys and group deltas per instance, preserving
/// server emission order.
async fn dispatch_values(event_tx: &mpsc::Sender<PushEvent>, table: IndexMap<String, PushValue>) {
    let mut per_instance: IndexMap<String, IndexMap<String, PushValue>> = IndexMap::new();

    for (key, value) in table {
        let Some((instance, property)) = wire::split_composite_key(&key) else {
            warn!(key = %key, "push key without property separator, skipping");
            continue;
        };
        per_instance
            .entry(instance.to_owned())
            .or_default()
            .insert(property.to_owned(), value);
    }

    for (instance_id, changes) in per_instance {
        if event_tx
            .send(PushEvent {
                instance_id,
                changes,
            })
            .await
            .is_err()
        {
            debug!("push event queue dropped, discarding update");
            return;
        }
    }
}

async fn reject_pending(conn: &Connection) {
    let mut pending = conn.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::ConnectionClosed));
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::Credentials;
    use crate::transport::TransportConfig;
    use secrecy::SecretString;
    use serde_json::json;

    fn test_session() -> Arc<SessionManager> {
        let base = Url::parse("https://centra.local").unwrap();
        let credentials = Credentials {
            username: "svc".into(),
            password: SecretString::from("secret".to_owned()),
        };
        Arc::new(SessionManager::new(&base, credentials, &TransportConfig::default()).unwrap())
    }

    /// Build a client whose link is already Connected, with the outbound
    /// queue exposed so tests can observe what would hit the wire.
    async fn connected_client(
        call_timeout: Duration,
    ) -> (
        SocketClient,
        Arc<Connection>,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let base = Url::parse("https://centra.local").unwrap();
        let mut config = SocketConfig::for_controller(&base).unwrap();
        config.call_timeout = call_timeout;

        let client = SocketClient::new(config, test_session());

        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let conn = Arc::new(Connection {
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            idle_limit: Duration::from_secs(240),
        });
        *client.inner.link.lock().await = Link::Connected(Arc::clone(&conn));
        let _ = client.inner.state_tx.send(LinkState::Connected);

        (client, conn, outbound_rx)
    }

    fn sent_envelope(msg: &tungstenite::Message) -> Request {
        match msg {
            tungstenite::Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn stream_url_derived_from_base() {
        let base = Url::parse("https://10.0.0.5:8443").unwrap();
        let config = SocketConfig::for_controller(&base).unwrap();
        assert_eq!(config.url.as_str(), "wss://10.0.0.5:8443/api/v1/stream");

        let base = Url::parse("http://centra.local").unwrap();
        let config = SocketConfig::for_controller(&base).unwrap();
        assert_eq!(config.url.as_str(), "ws://centra.local/api/v1/stream");
    }

    #[tokio::test]
    async fn call_while_disconnected_fails_fast() {
        let base = Url::parse("https://centra.local").unwrap();
        let config = SocketConfig::for_controller(&base).unwrap();
        let client = SocketClient::new(config, test_session());

        let result = client.call("GetInstances", vec![json!("light")]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn notify_operations_resolve_without_pending_request() {
        let (client, conn, mut outbound) = connected_client(Duration::from_secs(5)).await;

        let result = client.call(wire::OP_CLIENT_READY, vec![]).await.unwrap();
        assert_eq!(result, Value::Null);

        let envelope = sent_envelope(&outbound.recv().await.unwrap());
        assert_eq!(envelope.operation_name, wire::OP_CLIENT_READY);
        assert!(conn.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sequence_ids_start_at_one_and_increment() {
        let (client, _conn, mut outbound) = connected_client(Duration::from_secs(5)).await;

        client.call(wire::OP_CLIENT_READY, vec![]).await.unwrap();
        client.call(wire::OP_CLIENT_READY, vec![]).await.unwrap();

        let first = sent_envelope(&outbound.recv().await.unwrap());
        let second = sent_envelope(&outbound.recv().await.unwrap());
        assert_eq!(first.sequence_id, 1);
        assert_eq!(second.sequence_id, 2);
    }

    #[tokio::test]
    async fn call_times_out_and_clears_pending() {
        let (client, conn, _outbound) = connected_client(Duration::from_millis(20)).await;

        let result = client.call("GetInstances", vec![json!("light")]).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(conn.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_rejects_outstanding_calls() {
        let (client, _conn, _outbound) = connected_client(Duration::from_secs(30)).await;

        let caller = client.clone();
        let pending_call =
            tokio::spawn(async move { caller.call("GetInstances", vec![json!("light")]).await });

        // Let the call register its pending request before tearing down
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await;

        let result = pending_call.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn response_frame_resolves_pending_request() {
        let (client, conn, _outbound) = connected_client(Duration::from_secs(5)).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller.call("GetInstances", vec![json!("light")]).await
        });
        // Let the call register its pending request first
        tokio::time::sleep(Duration::from_millis(50)).await;

        let text = json!({
            "sequenceId": 1,
            "operationName": "GetInstances",
            "result": [ { "instanceId": "L1", "kind": "Light" } ]
        })
        .to_string();
        handle_frame(&client.inner, &conn, &text).await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result[0]["instanceId"], "L1");
    }

    #[tokio::test]
    async fn push_batch_groups_by_instance_and_skips_malformed_keys() {
        let (tx, mut rx) = mpsc::channel(16);

        let mut table = IndexMap::new();
        table.insert("dev.1.brightness".to_owned(), PushValue::new(json!(75)));
        table.insert("nodothere".to_owned(), PushValue::new(json!(1)));
        table.insert("dev.1.on".to_owned(), PushValue::new(json!(true)));
        table.insert("dev.2.on".to_owned(), PushValue::new(json!(false)));

        dispatch_values(&tx, table).await;
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.instance_id, "dev.1");
        let props: Vec<&str> = first.changes.keys().map(String::as_str).collect();
        assert_eq!(props, ["brightness", "on"]);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.instance_id, "dev.2");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn registry_survives_disconnect() {
        let (client, _conn, _outbound) = connected_client(Duration::from_secs(5)).await;

        {
            let mut registry = client.inner.registry.lock().await;
            registry
                .entry("L1".to_owned())
                .or_default()
                .insert("brightness".to_owned());
        }

        client.disconnect().await;

        let registry = client.inner.registry.lock().await;
        assert!(registry.contains_key("L1"));
    }
}
