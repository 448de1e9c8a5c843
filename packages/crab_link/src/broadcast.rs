//! Fan-out broadcast channel with independent subscriber cursors.
//!
//! Every call to [`Broadcaster::subscribe`] registers a fresh unbounded queue.
//! [`Broadcaster::publish`] pushes a clone of the item into every registered
//! queue, so each subscriber sees every item published after it subscribed,
//! in publish order, regardless of how fast the other subscribers drain.
//!
//! Queues are unbounded. A subscriber that never drains grows without limit;
//! dropping the [`Subscription`] releases its queue and the producer prunes it
//! on the next publish.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

struct Registry<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// Single-producer, many-subscriber broadcast sequence.
pub struct Broadcaster<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. Subscribing to a closed broadcaster yields a
    /// subscription that is already finished.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        if !registry.closed {
            registry.senders.push(tx);
        }
        Subscription { rx }
    }

    /// Finish every subscription. Items already queued are still delivered.
    /// Calling this more than once is a no-op.
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.closed = true;
        registry.senders.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    /// Number of live subscriptions (dropped ones are counted until the next publish).
    pub fn subscriber_count(&self) -> usize {
        self.registry().senders.len()
    }
}

impl<T: Clone> Broadcaster<T> {
    /// Deliver `item` to every live subscriber and return how many received it.
    pub fn publish(&self, item: T) -> usize {
        let mut registry = self.registry();
        if registry.closed {
            return 0;
        }
        registry.senders.retain(|tx| tx.send(item.clone()).is_ok());
        registry.senders.len()
    }
}

/// One subscriber's cursor into a [`Broadcaster`].
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wait for the next item. Returns `None` once the broadcaster is closed
    /// and every queued item has been taken.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next queued item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn poll_next_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().poll_next_item(cx)
    }
}
