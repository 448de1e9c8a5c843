//! Transport: the single physical WebSocket connection to the session server.
//!
//! One logical connection is maintained across socket drops. Every public
//! operation and every background task (receive, heartbeat, reconnect) mutates
//! state only while holding `Shared::inner`, and every background task checks
//! its cancellation token under that lock before publishing anything. That is
//! what makes "no events after `disconnect()` returns" hold.
//!
//! ```text
//!  Disconnected ──connect()──► Connecting ──handshake+probe ok──► Connected
//!                                  │                                  │
//!                        probe/handshake failed              drop / heartbeat miss
//!                                  ▼                                  ▼
//!                            Reconnecting(n) ◄────────────────────────┘
//!                                  │ delay elapsed → Connecting
//!                                  │ n >= max_attempts → Failed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::{ClientConfig, Endpoint};
use crate::error::ClientError;
use crate::protocol::{InboundMessage, decode_frame, encode_frame};
use crate::reconnect::ReconnectPolicy;
use crate::state::{ConnectionState, StateCell};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const PROBE_PAYLOAD: &[u8] = b"crab-link-probe";
const HEARTBEAT_PAYLOAD: &[u8] = b"crab-link-heartbeat";

/// How long `disconnect()` waits for the close handshake before dropping the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolved transport settings (runtime view of [`ClientConfig`]).
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub endpoint: Endpoint,
    pub auth_token: Option<String>,
    pub policy: ReconnectPolicy,
    /// When false, the first connection loss moves straight to `Failed`.
    pub auto_reconnect: bool,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Bounds the handshake and the connect-time ping; zero waits forever.
    pub liveness_timeout: Duration,
}

/// Owner of the physical connection.
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    options: TransportOptions,
    state: StateCell,
    messages: Broadcaster<InboundMessage>,
    inner: Mutex<Inner>,
    /// Parent of every session token; cancelled when the `Transport` is dropped.
    lifetime: CancellationToken,
}

struct Inner {
    should_reconnect: bool,
    /// Consecutive connection losses since the last successful connect.
    attempt: u32,
    /// Cancels everything spawned on behalf of the current `connect()`.
    session: CancellationToken,
    link: Option<Link>,
    next_link_id: u64,
}

/// A live socket and the tasks reading from / pinging it.
struct Link {
    id: u64,
    sink: Arc<Mutex<WsSink>>,
    cancel: CancellationToken,
}

/// Handshaken socket whose first ping was answered. Frames that arrived
/// before the pong are kept in `early` so they are published in order.
struct Established {
    sink: WsSink,
    source: WsSource,
    early: Vec<InboundMessage>,
}

impl Transport {
    pub fn new(options: TransportOptions) -> Self {
        let lifetime = CancellationToken::new();
        let session = lifetime.child_token();
        Self {
            shared: Arc::new(Shared {
                options,
                state: StateCell::new(ConnectionState::Disconnected),
                messages: Broadcaster::new(),
                inner: Mutex::new(Inner {
                    should_reconnect: false,
                    attempt: 0,
                    session,
                    link: None,
                    next_link_id: 1,
                }),
                lifetime,
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::new(config.transport_options()?))
    }

    pub fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Deduplicated state changes from this point on.
    pub fn state_changes(&self) -> Subscription<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Decoded inbound messages from this point on.
    pub fn messages(&self) -> Subscription<InboundMessage> {
        self.shared.messages.subscribe()
    }

    /// Open the connection and wait for the handshake and first ping/pong.
    ///
    /// No-op while `Connected` or `Connecting`. On failure the error is
    /// returned and, if reconnection is enabled, a retry is scheduled.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let session = {
            let mut inner = self.shared.inner.lock().await;
            if matches!(
                self.shared.state.get(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            inner.session.cancel();
            inner.session = self.shared.lifetime.child_token();
            inner.should_reconnect = true;
            inner.attempt = 0;
            self.shared.state.set(ConnectionState::Connecting);
            inner.session.clone()
        };

        info!(url = %self.shared.options.endpoint, "connecting");
        let result = self.shared.establish(&session).await;

        let mut inner = self.shared.inner.lock().await;
        if session.is_cancelled() {
            return Err(ClientError::ConnectionFailed(
                "connection cancelled".to_string(),
            ));
        }
        match result {
            Ok(established) => {
                self.shared.install(&mut inner, &session, established);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.shared.recover(&mut inner, &session, &err);
                Err(err)
            }
        }
    }

    /// Tear down the socket and every background task. Always succeeds.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.shared.inner.lock().await;
            inner.should_reconnect = false;
            inner.attempt = 0;
            inner.session.cancel();
            let link = inner.link.take();
            if let Some(link) = &link {
                link.cancel.cancel();
            }
            self.shared.state.set(ConnectionState::Disconnected);
            link
        };

        if let Some(link) = link {
            let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
                link.sink.lock().await.close().await
            })
            .await;
            if let Ok(Err(e)) = closed {
                debug!(error = %e, "close handshake failed");
            }
            info!(link = link.id, "disconnected");
        }
    }

    /// Serialize `message` as JSON and write it as one text frame.
    pub async fn send<M: Serialize + ?Sized>(&self, message: &M) -> Result<(), ClientError> {
        let sink = {
            let inner = self.shared.inner.lock().await;
            match &inner.link {
                Some(link) => link.sink.clone(),
                None => return Err(ClientError::NotConnected),
            }
        };
        let text = encode_frame(message).map_err(|e| ClientError::SendFailed(e.to_string()))?;
        sink.lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    /// Disconnect and finish every subscription.
    pub async fn close(&self) {
        self.disconnect().await;
        self.shared.state.close();
        self.shared.messages.close();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.lifetime.cancel();
    }
}

impl Shared {
    fn handshake_request(&self) -> Result<Request, ClientError> {
        let mut request = self
            .options
            .endpoint
            .url()
            .into_client_request()
            .map_err(ClientError::from_tungstenite)?;
        if let Some(token) = &self.options.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ClientError::ConnectionFailed("auth token is not a valid header value".into())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// Handshake, then one ping that must be answered.
    async fn establish(&self, session: &CancellationToken) -> Result<Established, ClientError> {
        let attempt = async {
            let request = self.handshake_request()?;
            let (ws, _response) = within(
                self.options.liveness_timeout,
                tokio_tungstenite::connect_async(request),
            )
            .await
            .map_err(|_| ClientError::ConnectionFailed("handshake timed out".into()))?
            .map_err(ClientError::from_tungstenite)?;

            let (mut sink, mut source) = ws.split();
            let early = within(
                self.options.liveness_timeout,
                probe(&mut sink, &mut source),
            )
            .await
            .map_err(|_| ClientError::ConnectionFailed("liveness probe timed out".into()))??;

            Ok::<_, ClientError>(Established {
                sink,
                source,
                early,
            })
        };

        tokio::select! {
            biased;
            _ = session.cancelled() => Err(ClientError::ConnectionFailed("connection cancelled".into())),
            result = attempt => result,
        }
    }

    /// Make `established` the live link and start its background tasks.
    fn install(
        self: &Arc<Self>,
        inner: &mut Inner,
        session: &CancellationToken,
        established: Established,
    ) {
        let id = inner.next_link_id;
        inner.next_link_id += 1;
        inner.attempt = 0;

        let cancel = session.child_token();
        let sink = Arc::new(Mutex::new(established.sink));
        inner.link = Some(Link {
            id,
            sink: sink.clone(),
            cancel: cancel.clone(),
        });

        self.state.set(ConnectionState::Connected);
        info!(url = %self.options.endpoint, link = id, "connected");
        for msg in established.early {
            self.messages.publish(msg);
        }

        let awaiting_pong = Arc::new(AtomicBool::new(false));
        tokio::spawn(receive_loop(
            self.clone(),
            id,
            cancel.clone(),
            established.source,
            awaiting_pong.clone(),
        ));
        if !self.options.heartbeat_interval.is_zero() {
            tokio::spawn(heartbeat_loop(self.clone(), id, cancel, sink, awaiting_pong));
        }
    }

    /// Decide what follows a failed connect or a lost link: schedule a retry,
    /// or give up with `Failed`.
    fn recover(
        self: &Arc<Self>,
        inner: &mut Inner,
        session: &CancellationToken,
        cause: &ClientError,
    ) {
        if !cause.is_retryable() || !(inner.should_reconnect && self.options.auto_reconnect) {
            inner.should_reconnect = false;
            error!(error = %cause, "connection failed, not retrying");
            self.state.set(ConnectionState::failed(cause.error_code()));
            return;
        }

        inner.attempt += 1;
        let attempt = inner.attempt;
        self.state.set(ConnectionState::Reconnecting { attempt });

        if self.options.policy.is_exhausted(attempt) {
            inner.should_reconnect = false;
            let err = ClientError::MaxReconnectAttemptsExceeded;
            error!(attempt, "giving up on reconnect");
            self.state.set(ConnectionState::failed(err.error_code()));
            return;
        }

        let delay = self.options.policy.delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::spawn(reconnect_after(self.clone(), session.clone(), delay));
    }

    /// Called by the receive or heartbeat task of link `link_id`. Only the
    /// first report for the current link has any effect.
    async fn connection_lost(self: &Arc<Self>, link_id: u64, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.link.as_ref().map(|l| l.id) != Some(link_id) {
            return;
        }
        let session = inner.session.clone();
        if session.is_cancelled() {
            return;
        }
        if let Some(link) = inner.link.take() {
            link.cancel.cancel();
        }
        warn!(link = link_id, reason = %reason, "connection lost");
        if !self.options.auto_reconnect {
            // A lost link with no retry budget at all is an exhausted budget.
            inner.should_reconnect = false;
            let err = ClientError::MaxReconnectAttemptsExceeded;
            error!(error = %err, "connection lost, reconnect disabled");
            self.state.set(ConnectionState::failed(err.error_code()));
            return;
        }
        self.recover(&mut inner, &session, &ClientError::ConnectionFailed(reason));
    }

    /// Publish one inbound frame unless the link was cancelled. Returns false
    /// once the caller should stop.
    async fn deliver(&self, cancel: &CancellationToken, bytes: &[u8]) -> bool {
        let Some(msg) = decode_or_warn(bytes) else {
            return true;
        };
        let _inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        self.messages.publish(msg);
        true
    }
}

async fn reconnect_after(shared: Arc<Shared>, session: CancellationToken, delay: Duration) {
    tokio::select! {
        biased;
        _ = session.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    {
        let inner = shared.inner.lock().await;
        if session.is_cancelled() || !inner.should_reconnect {
            return;
        }
        shared.state.set(ConnectionState::Connecting);
    }

    let result = shared.establish(&session).await;

    let mut inner = shared.inner.lock().await;
    if session.is_cancelled() {
        return;
    }
    match result {
        Ok(established) => shared.install(&mut inner, &session, established),
        Err(err) => {
            warn!(attempt = inner.attempt, error = %err, "reconnect failed");
            shared.recover(&mut inner, &session, &err);
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    link_id: u64,
    cancel: CancellationToken,
    mut source: WsSource,
    awaiting_pong: Arc<AtomicBool>,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if !shared.deliver(&cancel, text.as_str().as_bytes()).await {
                    return;
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                if !shared.deliver(&cancel, &bytes).await {
                    return;
                }
            }
            Some(Ok(Message::Pong(_))) => {
                awaiting_pong.store(false, Ordering::SeqCst);
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(f) => format!("server closed the connection: {}", f.reason.as_str()),
                    None => "server closed the connection".to_string(),
                };
            }
            // Pings are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("receive failed: {e}"),
            None => break "connection closed".to_string(),
        }
    };
    shared.connection_lost(link_id, reason).await;
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    link_id: u64,
    cancel: CancellationToken,
    sink: Arc<Mutex<WsSink>>,
    awaiting_pong: Arc<AtomicBool>,
) {
    let period = shared.options.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if awaiting_pong.swap(true, Ordering::SeqCst) {
            break "heartbeat pong missed".to_string();
        }
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = async {
                sink.lock()
                    .await
                    .send(Message::Ping(HEARTBEAT_PAYLOAD.to_vec().into()))
                    .await
            } => sent,
        };
        if let Err(e) = sent {
            break format!("heartbeat failed: {e}");
        }
        debug!(link = link_id, "heartbeat sent");
    };
    shared.connection_lost(link_id, reason).await;
}

/// Send one ping and read until its pong arrives.
async fn probe(
    sink: &mut WsSink,
    source: &mut WsSource,
) -> Result<Vec<InboundMessage>, ClientError> {
    sink.send(Message::Ping(PROBE_PAYLOAD.to_vec().into()))
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("liveness probe failed: {e}")))?;

    let mut early = Vec::new();
    loop {
        match source.next().await {
            Some(Ok(Message::Pong(_))) => return Ok(early),
            Some(Ok(Message::Text(text))) => {
                early.extend(decode_or_warn(text.as_str().as_bytes()));
            }
            Some(Ok(Message::Binary(bytes))) => early.extend(decode_or_warn(&bytes)),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::ConnectionFailed(
                    "connection closed during liveness probe".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ClientError::ConnectionFailed(format!(
                    "liveness probe failed: {e}"
                )));
            }
        }
    }
}

fn decode_or_warn(bytes: &[u8]) -> Option<InboundMessage> {
    match decode_frame(bytes) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "dropping undecodable frame");
            None
        }
    }
}

/// `tokio::time::timeout`, except a zero duration means no deadline.
async fn within<F: std::future::Future>(
    limit: Duration,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    if limit.is_zero() {
        Ok(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await
    }
}
