//! Message router: splits the inbound message feed into five typed feeds.
//!
//! Each [`InboundMessage`] variant goes to exactly one typed [`Broadcaster`].
//! Per-session views ([`SessionFilter`]) subscribe to a typed feed and drop
//! items for other sessions; they never add a second subscription upstream.
//!
//! `start()` and `stop()` flip routing under `gate`, and the routing loop
//! publishes while holding the same lock after checking its token, so once
//! either call returns a superseded loop can no longer deliver anything.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broadcast::{Broadcaster, Subscription};
use crate::connection::Connection;
use crate::protocol::{
    ChatOutput, InboundMessage, PromptRequest, ServerError, SessionScoped, SessionStateChange,
    SyncSnapshot,
};
use crate::transport::Transport;

/// Anything that exposes a feed of decoded inbound messages.
pub trait MessageSource: Send + Sync {
    fn subscribe_messages(&self) -> Subscription<InboundMessage>;
}

impl MessageSource for Connection {
    fn subscribe_messages(&self) -> Subscription<InboundMessage> {
        self.messages()
    }
}

impl MessageSource for Transport {
    fn subscribe_messages(&self) -> Subscription<InboundMessage> {
        self.messages()
    }
}

impl MessageSource for Broadcaster<InboundMessage> {
    fn subscribe_messages(&self) -> Subscription<InboundMessage> {
        self.subscribe()
    }
}

#[derive(Default)]
struct Channels {
    cli_outputs: Broadcaster<ChatOutput>,
    session_states: Broadcaster<SessionStateChange>,
    prompt_requests: Broadcaster<PromptRequest>,
    errors: Broadcaster<ServerError>,
    syncs: Broadcaster<SyncSnapshot>,
}

impl Channels {
    fn dispatch(&self, msg: InboundMessage) {
        match msg {
            InboundMessage::ChatOutput(m) => {
                self.cli_outputs.publish(m);
            }
            InboundMessage::SessionState(m) => {
                self.session_states.publish(m);
            }
            InboundMessage::PromptRequest(m) => {
                self.prompt_requests.publish(m);
            }
            InboundMessage::Error(m) => {
                self.errors.publish(m);
            }
            InboundMessage::Sync(m) => {
                self.syncs.publish(m);
            }
        }
    }

    fn close(&self) {
        self.cli_outputs.close();
        self.session_states.close();
        self.prompt_requests.close();
        self.errors.close();
        self.syncs.close();
    }
}

pub struct MessageRouter {
    source: Arc<dyn MessageSource>,
    channels: Arc<Channels>,
    /// Token of the running routing loop, if any.
    gate: Arc<Mutex<Option<CancellationToken>>>,
}

impl MessageRouter {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            channels: Arc::new(Channels::default()),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        lock_gate(&self.gate)
    }

    /// Replace any running routing loop with a fresh one. Messages published
    /// by the source after this returns are routed.
    pub fn start(&self) {
        let mut gate = self.gate();
        if let Some(previous) = gate.take() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        let upstream = self.source.subscribe_messages();
        *gate = Some(cancel.clone());

        tokio::spawn(route(
            upstream,
            self.channels.clone(),
            self.gate.clone(),
            cancel,
        ));
        debug!("router started");
    }

    /// Stop routing. Messages arriving while stopped are never delivered to
    /// typed subscribers, even after a later `start()`.
    pub fn stop(&self) {
        if let Some(cancel) = self.gate().take() {
            cancel.cancel();
            debug!("router stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate().is_some()
    }

    pub fn cli_outputs(&self) -> Subscription<ChatOutput> {
        self.channels.cli_outputs.subscribe()
    }

    pub fn session_states(&self) -> Subscription<SessionStateChange> {
        self.channels.session_states.subscribe()
    }

    pub fn prompt_requests(&self) -> Subscription<PromptRequest> {
        self.channels.prompt_requests.subscribe()
    }

    pub fn errors(&self) -> Subscription<ServerError> {
        self.channels.errors.subscribe()
    }

    pub fn syncs(&self) -> Subscription<SyncSnapshot> {
        self.channels.syncs.subscribe()
    }

    pub fn cli_outputs_for(&self, session_id: &str) -> SessionFilter<ChatOutput> {
        SessionFilter::new(self.cli_outputs(), session_id)
    }

    pub fn session_states_for(&self, session_id: &str) -> SessionFilter<SessionStateChange> {
        SessionFilter::new(self.session_states(), session_id)
    }

    pub fn prompt_requests_for(&self, session_id: &str) -> SessionFilter<PromptRequest> {
        SessionFilter::new(self.prompt_requests(), session_id)
    }

    pub fn errors_for(&self, session_id: &str) -> SessionFilter<ServerError> {
        SessionFilter::new(self.errors(), session_id)
    }

    /// Includes snapshots that carry no session identifier.
    pub fn syncs_for(&self, session_id: &str) -> SessionFilter<SyncSnapshot> {
        SessionFilter::new(self.syncs(), session_id)
    }

    /// Stop routing and finish every typed subscription.
    pub fn close(&self) {
        self.stop();
        self.channels.close();
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_gate(
    gate: &Mutex<Option<CancellationToken>>,
) -> MutexGuard<'_, Option<CancellationToken>> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn route(
    mut upstream: Subscription<InboundMessage>,
    channels: Arc<Channels>,
    gate: Arc<Mutex<Option<CancellationToken>>>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = upstream.recv() => msg,
        };
        let Some(msg) = msg else {
            break;
        };

        let _gate = lock_gate(&gate);
        if cancel.is_cancelled() {
            break;
        }
        trace!(kind = msg.kind().as_str(), "routing message");
        channels.dispatch(msg);
    }
}

/// A typed feed narrowed to one session.
#[derive(Debug)]
pub struct SessionFilter<T> {
    inner: Subscription<T>,
    session_id: String,
}

impl<T: SessionScoped> SessionFilter<T> {
    fn new(inner: Subscription<T>, session_id: &str) -> Self {
        Self {
            inner,
            session_id: session_id.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let item = self.inner.recv().await?;
            if item.matches_session(&self.session_id) {
                return Some(item);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        while let Some(item) = self.inner.try_recv() {
            if item.matches_session(&self.session_id) {
                return Some(item);
            }
        }
        None
    }
}

impl<T: SessionScoped> Stream for SessionFilter<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_next_item(cx) {
                Poll::Ready(Some(item)) if !item.matches_session(&this.session_id) => continue,
                other => return other,
            }
        }
    }
}
