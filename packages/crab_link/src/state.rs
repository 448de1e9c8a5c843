use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::broadcast::{Broadcaster, Subscription};

/// Connection lifecycle as observed by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after the `attempt`-th consecutive connection loss.
    Reconnecting { attempt: u32 },
    /// Terminal until the next explicit `connect()`.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// `Disconnected` and `Failed` only change on an explicit `connect()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }

    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
            Self::Failed { reason } => write!(f, "failed({reason})"),
        }
    }
}

/// Current state plus a change feed that never repeats a value twice in a row.
///
/// The value lock is held while publishing so concurrent writers cannot
/// reorder notifications relative to the stored value.
pub(crate) struct StateCell {
    current: Mutex<ConnectionState>,
    changes: Broadcaster<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            current: Mutex::new(initial),
            changes: Broadcaster::new(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `next` and notify subscribers. Returns `false` when `next` equals
    /// the current value, in which case nothing is published.
    pub fn set(&self, next: ConnectionState) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == next {
            return false;
        }
        *current = next.clone();
        self.changes.publish(next);
        true
    }

    pub fn subscribe(&self) -> Subscription<ConnectionState> {
        self.changes.subscribe()
    }

    pub fn close(&self) {
        self.changes.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 3 }.to_string(),
            "reconnecting(3)"
        );
        assert_eq!(
            ConnectionState::failed("max_reconnect_attempts_exceeded").to_string(),
            "failed(max_reconnect_attempts_exceeded)"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::failed("x").is_terminal());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_terminal());
        assert!(ConnectionState::Connected.is_connected());
    }

    #[test]
    fn consecutive_duplicates_are_suppressed() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        let mut sub = cell.subscribe();

        assert!(!cell.set(ConnectionState::Disconnected));
        assert!(cell.set(ConnectionState::Connecting));
        assert!(!cell.set(ConnectionState::Connecting));
        assert!(cell.set(ConnectionState::Connected));
        assert!(cell.set(ConnectionState::Reconnecting { attempt: 1 }));
        assert!(!cell.set(ConnectionState::Reconnecting { attempt: 1 }));
        assert!(cell.set(ConnectionState::Reconnecting { attempt: 2 }));

        let mut seen = Vec::new();
        while let Some(s) = sub.try_recv() {
            seen.push(s);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Reconnecting { attempt: 2 },
            ]
        );
        assert_eq!(cell.get(), ConnectionState::Reconnecting { attempt: 2 });
    }

    #[test]
    fn serializes_with_state_tag() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json, r#"{"state":"reconnecting","attempt":2}"#);
    }
}
