use reqwest::StatusCode;

/// The seven error kinds from the design: not every caller needs to match on
/// all of them, but retry/abort decisions are always made against this enum,
/// never by inspecting a message string.
#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("config: {0}")]
    Config(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("server returned {0}")]
    Server(StatusCode),
    #[error("integrity: {0}")]
    Integrity(String),
    #[error("filesystem: {0}")]
    Filesystem(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

impl Kind {
    /// Retryable per the classification table in the design: transient
    /// transport faults, 429/5xx, and integrity failures (often a corrupt or
    /// truncated transfer) are worth another attempt. Auth, filesystem, and
    /// protocol errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Kind::Transport(_) => true,
            Kind::Integrity(_) => true,
            Kind::Server(status) => {
                matches!(
                    *status,
                    StatusCode::TOO_MANY_REQUESTS
                        | StatusCode::INTERNAL_SERVER_ERROR
                        | StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                )
            }
            Kind::Config(_) | Kind::Auth(_) | Kind::Filesystem(_) | Kind::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for Kind {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
            Kind::Transport(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                Kind::Server(status)
            } else {
                Kind::Protocol(e.to_string())
            }
        } else {
            // body/decode errors surface here too; a connection dropped mid-stream
            // looks like this to reqwest, so treat it as transport
            Kind::Transport(e.to_string())
        }
    }
}

impl From<std::io::Error> for Kind {
    fn from(e: std::io::Error) -> Self {
        Kind::Filesystem(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Kind>;
