//! Connection façade.
//!
//! Wraps a [`Transport`] and re-publishes its state changes and inbound
//! messages on channels owned by the façade, so subscribers stay attached to
//! the `Connection` even if the transport underneath is replaced.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{ClientMessage, InboundMessage};
use crate::state::{ConnectionState, StateCell};
use crate::transport::Transport;

/// The two loops copying transport output into the façade's channels.
struct Forwarders {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Connection {
    transport: Transport,
    state: Arc<StateCell>,
    messages: Arc<Broadcaster<InboundMessage>>,
    forwarders: Mutex<Option<Forwarders>>,
}

impl Connection {
    pub fn new(transport: Transport) -> Self {
        Self {
            state: Arc::new(StateCell::new(transport.current_state())),
            messages: Arc::new(Broadcaster::new()),
            transport,
            forwarders: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::new(Transport::from_config(config)?))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn forwarders(&self) -> MutexGuard<'_, Option<Forwarders>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start mirroring the transport if not already doing so. Subscriptions
    /// are taken before returning so nothing published afterwards is missed.
    fn ensure_forwarding(&self) {
        let mut slot = self.forwarders();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let states = self.transport.state_changes();
        let messages = self.transport.messages();
        self.state.set(self.transport.current_state());

        let state = self.state.clone();
        let state_task = tokio::spawn(forward(cancel.clone(), states, move |s| {
            state.set(s);
        }));
        let sink = self.messages.clone();
        let message_task = tokio::spawn(forward(cancel.clone(), messages, move |m| {
            sink.publish(m);
        }));

        *slot = Some(Forwarders {
            cancel,
            tasks: vec![state_task, message_task],
        });
    }

    async fn stop_forwarding(&self) {
        let Some(forwarders) = self.forwarders().take() else {
            return;
        };
        forwarders.cancel.cancel();
        for task in forwarders.tasks {
            let _ = task.await;
        }
        debug!("forwarding stopped");
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.ensure_forwarding();
        self.transport.connect().await
    }

    /// Stop forwarding first, then disconnect the transport. Once this
    /// returns, subscribers see `Disconnected` and nothing after it.
    pub async fn disconnect(&self) {
        self.stop_forwarding().await;
        self.transport.disconnect().await;
        self.state.set(ConnectionState::Disconnected);
    }

    pub async fn send<M: Serialize + ?Sized>(&self, message: &M) -> Result<(), ClientError> {
        self.transport.send(message).await
    }

    pub async fn send_message(&self, message: &ClientMessage) -> Result<(), ClientError> {
        self.send(message).await
    }

    pub fn current_state(&self) -> ConnectionState {
        self.transport.current_state()
    }

    pub fn state_changes(&self) -> Subscription<ConnectionState> {
        self.state.subscribe()
    }

    pub fn messages(&self) -> Subscription<InboundMessage> {
        self.messages.subscribe()
    }

    /// Disconnect and finish every subscription on the façade and the transport.
    pub async fn close(&self) {
        self.disconnect().await;
        self.state.close();
        self.messages.close();
        self.transport.close().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(forwarders) = self.forwarders().take() {
            forwarders.cancel.cancel();
        }
    }
}

async fn forward<T, F>(cancel: CancellationToken, mut upstream: Subscription<T>, publish: F)
where
    T: Send + 'static,
    F: Fn(T) + Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = upstream.recv() => item,
        };
        match item {
            Some(item) => publish(item),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SessionStateChange, SyncSnapshot};
    use crate::test_server::{TEST_TIMEOUT, TestServer};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next<T>(sub: &mut Subscription<T>) -> T {
        timeout(TEST_TIMEOUT, sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("feed closed")
    }

    async fn assert_quiet<T: std::fmt::Debug>(sub: &mut Subscription<T>) {
        if let Ok(item) = timeout(Duration::from_millis(200), sub.recv()).await {
            panic!("expected no further events, got {item:?}");
        }
    }

    fn state_msg(session: &str, state: &str) -> InboundMessage {
        InboundMessage::SessionState(SessionStateChange {
            session_id: session.into(),
            state: state.into(),
            detail: None,
            timestamp: None,
        })
    }

    #[tokio::test]
    async fn mirrors_transport_states_and_messages() {
        let mut server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        let mut states = conn.state_changes();
        let mut messages = conn.messages();

        conn.connect().await.unwrap();
        let peer = server.next_conn().await;
        peer.send_message(&state_msg("s1", "thinking"));

        assert_eq!(next(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);
        assert_eq!(next(&mut messages).await, state_msg("s1", "thinking"));
        assert_eq!(conn.current_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn subscribers_survive_a_reconnect() {
        let mut server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        let mut messages = conn.messages();
        let mut states = conn.state_changes();
        conn.connect().await.unwrap();
        let peer = server.next_conn().await;
        assert_eq!(next(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);

        peer.drop_socket().await;
        assert_eq!(
            next(&mut states).await,
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(next(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);

        let peer = server.next_conn().await;
        let sync = InboundMessage::Sync(SyncSnapshot {
            session_id: None,
            payload: serde_json::json!({"sessions": 2}),
            timestamp: None,
        });
        peer.send_message(&sync);
        assert_eq!(next(&mut messages).await, sync);
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_disconnect_returns() {
        let mut server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        let mut states = conn.state_changes();
        let mut messages = conn.messages();

        conn.connect().await.unwrap();
        let peer = server.next_conn().await;
        assert_eq!(next(&mut states).await, ConnectionState::Connecting);
        assert_eq!(next(&mut states).await, ConnectionState::Connected);

        conn.disconnect().await;
        peer.send_message(&state_msg("s1", "idle"));

        assert_eq!(next(&mut states).await, ConnectionState::Disconnected);
        assert_quiet(&mut states).await;
        assert_quiet(&mut messages).await;
    }

    #[tokio::test]
    async fn reconnecting_after_disconnect_resumes_forwarding() {
        let mut server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        conn.connect().await.unwrap();
        let _first = server.next_conn().await;
        conn.disconnect().await;

        let mut messages = conn.messages();
        conn.connect().await.unwrap();
        let peer = server.next_conn().await;
        peer.send_message(&state_msg("s2", "waiting_for_input"));

        assert_eq!(
            next(&mut messages).await,
            state_msg("s2", "waiting_for_input")
        );
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        let mut states = conn.state_changes();

        let err = conn
            .send_message(&ClientMessage::RequestSync { session_id: None })
            .await
            .unwrap_err();

        assert_eq!(err, ClientError::NotConnected);
        assert_eq!(conn.current_state(), ConnectionState::Disconnected);
        assert_quiet(&mut states).await;
    }

    #[tokio::test]
    async fn outbound_messages_reach_the_server() {
        let mut server = TestServer::start().await;
        let conn = Connection::new(Transport::new(server.options()));
        conn.connect().await.unwrap();
        let mut peer = server.next_conn().await;

        conn.send_message(&ClientMessage::PromptResponse {
            session_id: "s1".into(),
            prompt_id: "p1".into(),
            response: "yes".into(),
        })
        .await
        .unwrap();

        assert_eq!(
            peer.next_text().await,
            r#"{"type":"prompt_response","session_id":"s1","prompt_id":"p1","response":"yes"}"#
        );
    }
}
