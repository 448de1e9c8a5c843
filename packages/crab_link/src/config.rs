use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::error::ClientError;
use crate::reconnect::{MAX_JITTER, ReconnectPolicy};
use crate::transport::TransportOptions;

// =============================================================================
// Client config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     host = "10.0.0.5"
//                    max_reconnect_attempts = 3
//
//   env var:         CRAB_LINK_HOST=10.0.0.5
//                    CRAB_LINK_AUTH_TOKEN=...

/// Path of the multiplexed session socket on the server.
pub const DEFAULT_PATH: &str = "/api/ws";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use `wss://` instead of `ws://`.
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_path")]
    pub path: String,
    /// Bearer token sent in the handshake's `Authorization` header.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_reconnect_delay_secs")]
    pub initial_reconnect_delay_secs: f64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: f64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,
    /// Upper bound on the handshake and on the connect-time ping/pong.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            path: default_path(),
            auth_token: None,
            auto_reconnect: default_auto_reconnect(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_reconnect_delay_secs: default_initial_reconnect_delay_secs(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            reconnect_jitter: default_reconnect_jitter(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_path() -> String {
    DEFAULT_PATH.to_string()
}
fn default_auto_reconnect() -> bool {
    true
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_initial_reconnect_delay_secs() -> f64 {
    1.0
}
fn default_max_reconnect_delay_secs() -> f64 {
    60.0
}
fn default_reconnect_jitter() -> f64 {
    MAX_JITTER
}
fn default_heartbeat_interval_secs() -> f64 {
    30.0
}
fn default_liveness_timeout_secs() -> f64 {
    10.0
}

/// Negative, NaN or infinite seconds collapse to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl ClientConfig {
    pub fn endpoint(&self) -> Result<Endpoint, ClientError> {
        Endpoint::new(&self.host, self.port, self.tls, &self.path)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            initial_delay: secs(self.initial_reconnect_delay_secs),
            max_delay: secs(self.max_reconnect_delay_secs),
            jitter: self.reconnect_jitter.clamp(0.0, MAX_JITTER),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        secs(self.liveness_timeout_secs)
    }

    /// Resolve everything a `Transport` needs, validating the endpoint.
    pub fn transport_options(&self) -> Result<TransportOptions, ClientError> {
        Ok(TransportOptions {
            endpoint: self.endpoint()?,
            auth_token: self.auth_token.clone().filter(|t| !t.is_empty()),
            policy: self.reconnect_policy(),
            auto_reconnect: self.auto_reconnect,
            heartbeat_interval: self.heartbeat_interval(),
            liveness_timeout: self.liveness_timeout(),
        })
    }
}

/// A validated `ws://` / `wss://` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, tls: bool, path: &str) -> Result<Self, ClientError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ClientError::InvalidEndpoint("empty host".into()));
        }
        let scheme = if tls { "wss" } else { "ws" };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self::parse(&format!("{scheme}://{host}:{port}{path}"))
    }

    /// Accept a full URL; only `ws` and `wss` schemes with a host are valid.
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ClientError::InvalidEndpoint(format!("{url}: {e}")))?;
        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            other => {
                return Err(ClientError::InvalidEndpoint(format!(
                    "{url}: unsupported scheme {other:?}"
                )));
            }
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidEndpoint(format!("{url}: missing host")));
        }
        Ok(Self {
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_tls(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Default config directory: `~/.crablink`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".crablink"))
}

/// Build a figment that layers: defaults → `<config_dir>/config.toml` → `CRAB_LINK_*` env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ClientConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CRAB_LINK_").split("__"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.max_reconnect_attempts, 10);
        assert_eq!(c.initial_reconnect_delay_secs, 1.0);
        assert_eq!(c.max_reconnect_delay_secs, 60.0);
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(30));
        assert!(c.auto_reconnect);
        assert!(c.auth_token.is_none());
        assert_eq!(c.endpoint().unwrap().url(), "ws://127.0.0.1:7777/api/ws");
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let c = ClientConfig {
            max_reconnect_attempts: 3,
            initial_reconnect_delay_secs: 0.5,
            max_reconnect_delay_secs: 4.0,
            reconnect_jitter: 0.9,
            ..Default::default()
        };
        let p = c.reconnect_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(4));
        assert_eq!(p.jitter, MAX_JITTER);
    }

    #[test]
    fn test_negative_durations_collapse_to_zero() {
        let c = ClientConfig {
            heartbeat_interval_secs: -1.0,
            ..Default::default()
        };
        assert_eq!(c.heartbeat_interval(), Duration::ZERO);
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let c = ClientConfig {
            auth_token: Some(String::new()),
            ..Default::default()
        };
        assert!(c.transport_options().unwrap().auth_token.is_none());
    }

    // ── Endpoint ────────────────────────────────────────────────────────

    #[test]
    fn test_tls_selects_wss() {
        let e = Endpoint::new("example.com", 443, true, "/api/ws").unwrap();
        assert_eq!(e.url(), "wss://example.com:443/api/ws");
        assert!(e.is_tls());
        let e = Endpoint::new("example.com", 80, false, "api/ws").unwrap();
        assert_eq!(e.url(), "ws://example.com:80/api/ws");
        assert!(!e.is_tls());
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(matches!(
            Endpoint::new("  ", 80, false, "/"),
            Err(ClientError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::new("bad host", 80, false, "/"),
            Err(ClientError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("http://example.com/api/ws"),
            Err(ClientError::InvalidEndpoint(_))
        ));
        assert!(Endpoint::parse("ws://localhost:9000/api/ws").is_ok());
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let c: ClientConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.path, DEFAULT_PATH);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "host = \"10.0.0.5\"\nport = 8443\ntls = true\nmax_reconnect_attempts = 3\nauth_token = \"secret\"\n",
        )
        .unwrap();
        let c: ClientConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(c.host, "10.0.0.5");
        assert_eq!(c.port, 8443);
        assert_eq!(c.max_reconnect_attempts, 3);
        assert_eq!(c.auth_token.as_deref(), Some("secret"));
        assert_eq!(c.endpoint().unwrap().url(), "wss://10.0.0.5:8443/api/ws");
        // Unset keys keep their defaults.
        assert_eq!(c.heartbeat_interval_secs, 30.0);
    }
}
