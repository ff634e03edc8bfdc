use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Status code reported to the client when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
