use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("maximum reconnect attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl ClientError {
    /// Stable machine-readable code; also used as the `Failed` state reason.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::NotConnected => "not_connected",
            Self::SendFailed(_) => "send_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::MaxReconnectAttemptsExceeded => "max_reconnect_attempts_exceeded",
        }
    }

    /// Whether another connection attempt could succeed without user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidEndpoint(_) | Self::AuthenticationFailed | Self::MaxReconnectAttemptsExceeded
        )
    }

    /// Classify a handshake error from the WebSocket layer.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Self::AuthenticationFailed
            }
            tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => {
                Self::InvalidEndpoint(err.to_string())
            }
            _ => Self::ConnectionFailed(err.to_string()),
        }
    }
}
