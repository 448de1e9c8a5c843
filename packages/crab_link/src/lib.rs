//! Crab Link - reconnecting real-time client for Crab City session servers
//!
//! One WebSocket carries every session's traffic. [`Transport`] keeps that
//! socket alive (bearer-token handshake, heartbeat, exponential backoff),
//! [`Connection`] gives the rest of the application a stable handle whose
//! subscriptions survive reconnects, and [`MessageRouter`] splits the inbound
//! feed into five typed feeds with optional per-session views.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crab_link::{ClientConfig, ClientMessage, Connection, MessageRouter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), crab_link::ClientError> {
//!     let config = ClientConfig {
//!         auth_token: Some("secret".to_string()),
//!         ..Default::default()
//!     };
//!     let conn = Arc::new(Connection::from_config(&config)?);
//!
//!     let router = MessageRouter::new(conn.clone());
//!     let mut outputs = router.cli_outputs_for("session-1");
//!     router.start();
//!
//!     conn.connect().await?;
//!     conn.send_message(&ClientMessage::Input {
//!         session_id: "session-1".to_string(),
//!         text: "hello".to_string(),
//!     })
//!     .await?;
//!
//!     while let Some(output) = outputs.recv().await {
//!         println!("{}", output.content);
//!     }
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
mod connection;
mod error;
mod handlers;
pub mod protocol;
mod reconnect;
mod router;
mod state;
mod transport;

#[cfg(test)]
mod test_server;

pub use broadcast::{Broadcaster, Subscription};
pub use config::{ClientConfig, Endpoint, default_config_dir, load_config};
pub use connection::Connection;
pub use error::ClientError;
pub use handlers::HandlerRegistry;
pub use protocol::{
    ChatOutput, ClientMessage, InboundMessage, MessageKind, OutputKind, PromptRequest,
    ServerError, SessionScoped, SessionStateChange, SyncSnapshot,
};
pub use reconnect::ReconnectPolicy;
pub use router::{MessageRouter, MessageSource, SessionFilter};
pub use state::ConnectionState;
pub use transport::{Transport, TransportOptions};
