//! Scripted loopback WebSocket server for transport-level tests.
//!
//! Each accepted connection is driven by its own task. While the task is
//! reading, tungstenite answers pings automatically; `mute()` stops reading so
//! pings go unanswered.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::config::Endpoint;
use crate::protocol::InboundMessage;
use crate::reconnect::ReconnectPolicy;
use crate::transport::TransportOptions;

/// Timeout for each awaited event in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct ServerOptions {
    /// Reject handshakes whose bearer token differs with 401.
    pub required_token: Option<String>,
    /// Accepted connections never read, so no pong is ever sent.
    pub mute_on_accept: bool,
}

enum Command {
    Text(String),
    Binary(Vec<u8>),
    Close,
    Mute,
}

/// Server side of one accepted connection.
pub struct ServerConn {
    pub authorization: Option<String>,
    commands: mpsc::UnboundedSender<Command>,
    received: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl ServerConn {
    pub fn send_text(&self, text: &str) {
        let _ = self.commands.send(Command::Text(text.to_string()));
    }

    pub fn send_message(&self, msg: &InboundMessage) {
        self.send_text(&serde_json::to_string(msg).unwrap());
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.commands.send(Command::Binary(bytes));
    }

    /// Send a close frame and end the connection.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Stop reading; further pings from the client go unanswered.
    pub fn mute(&self) {
        let _ = self.commands.send(Command::Mute);
    }

    /// Drop the socket without a closing handshake.
    pub async fn drop_socket(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Next text frame the client sent.
    pub async fn next_text(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.received.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("connection task ended")
    }
}

pub struct TestServer {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    accept_task: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (conn_tx, conns) = mpsc::unbounded_channel();
        let options = Arc::new(options);

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::new(Mutex::new(None::<String>));
                let seen_cb = seen.clone();
                let required = options.required_token.clone();
                let callback = move |req: &Request, resp: Response| {
                    let header = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *seen_cb.lock().unwrap() = header.clone();
                    if let Some(token) = required {
                        if header.as_deref() != Some(format!("Bearer {token}").as_str()) {
                            let mut err = ErrorResponse::new(Some("unauthorized".into()));
                            *err.status_mut() = StatusCode::UNAUTHORIZED;
                            return Err(err);
                        }
                    }
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };

                let (commands, mut command_rx) = mpsc::unbounded_channel();
                let (received_tx, received) = mpsc::unbounded_channel();
                let mut muted = options.mute_on_accept;
                let task = tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            cmd = command_rx.recv() => match cmd {
                                Some(Command::Text(t)) => {
                                    if write.send(Message::Text(t.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Binary(b)) => {
                                    if write.send(Message::Binary(b.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Command::Close) => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break;
                                }
                                Some(Command::Mute) => muted = true,
                                None => break,
                            },
                            frame = read.next(), if !muted => match frame {
                                Some(Ok(Message::Text(t))) => {
                                    let _ = received_tx.send(t.as_str().to_string());
                                }
                                Some(Ok(_)) => {}
                                Some(Err(_)) | None => break,
                            },
                        }
                    }
                });

                let authorization = seen.lock().unwrap().clone();
                let conn = ServerConn {
                    authorization,
                    commands,
                    received,
                    task,
                };
                if conn_tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            conns,
            accept_task: Some(accept_task),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&format!("ws://{}/api/ws", self.addr)).unwrap()
    }

    /// Fast-retrying options pointed at this server.
    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            endpoint: self.endpoint(),
            auth_token: Some("test-token".into()),
            policy: ReconnectPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
                jitter: 0.0,
            },
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(2),
        }
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        timeout(TEST_TIMEOUT, self.conns.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept loop ended")
    }

    /// Close the listener; later dials are refused.
    pub async fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
