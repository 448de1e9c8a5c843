//! Callback registration over the router's typed feeds.
//!
//! Each `on_*` call subscribes to one typed feed and spawns a loop that calls
//! the handler once per item, in arrival order. `remove_all_handlers()`
//! cancels every loop and waits for them, so no handler runs after it returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broadcast::Subscription;
use crate::protocol::{ChatOutput, PromptRequest, ServerError, SessionStateChange, SyncSnapshot};
use crate::router::MessageRouter;

struct Registration {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HandlerRegistry {
    router: Arc<MessageRouter>,
    registrations: Mutex<Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new(router: Arc<MessageRouter>) -> Self {
        Self {
            router,
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register<T, F>(&self, feed: Subscription<T>, handler: F)
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_handler(cancel.clone(), feed, handler));
        self.registrations().push(Registration { cancel, task });
    }

    pub fn on_cli_output<F>(&self, handler: F)
    where
        F: Fn(ChatOutput) + Send + Sync + 'static,
    {
        self.register(self.router.cli_outputs(), handler);
    }

    pub fn on_session_state<F>(&self, handler: F)
    where
        F: Fn(SessionStateChange) + Send + Sync + 'static,
    {
        self.register(self.router.session_states(), handler);
    }

    pub fn on_prompt_request<F>(&self, handler: F)
    where
        F: Fn(PromptRequest) + Send + Sync + 'static,
    {
        self.register(self.router.prompt_requests(), handler);
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(ServerError) + Send + Sync + 'static,
    {
        self.register(self.router.errors(), handler);
    }

    pub fn on_sync<F>(&self, handler: F)
    where
        F: Fn(SyncSnapshot) + Send + Sync + 'static,
    {
        self.register(self.router.syncs(), handler);
    }

    /// Registrations whose loop is still running.
    pub fn handler_count(&self) -> usize {
        self.registrations()
            .iter()
            .filter(|r| !r.task.is_finished())
            .count()
    }

    pub async fn remove_all_handlers(&self) {
        let registrations = std::mem::take(&mut *self.registrations());
        let count = registrations.len();
        for r in &registrations {
            r.cancel.cancel();
        }
        for r in registrations {
            let _ = r.task.await;
        }
        debug!(count, "handlers removed");
    }
}

impl Drop for HandlerRegistry {
    fn drop(&mut self) {
        for r in self.registrations().drain(..) {
            r.cancel.cancel();
        }
    }
}

async fn run_handler<T, F>(cancel: CancellationToken, mut feed: Subscription<T>, handler: F)
where
    F: Fn(T),
{
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = feed.recv() => item,
        };
        match item {
            Some(item) => handler(item),
            None => break,
        }
    }
}
