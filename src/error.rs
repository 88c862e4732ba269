// src/error.rs
use thiserror::Error;

/// Ошибки обращения к бирже / брокеру.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected payload: {0}")]
    Decode(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Unavailable(String),
}

impl ConnectorError {
    /// Timeouts, connection drops, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Timeout | ConnectorError::Connect(_) => true,
            ConnectorError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            // Malformed body on a 2xx is usually a truncated response.
            ConnectorError::Decode(_) => true,
            ConnectorError::Rejected(_) | ConnectorError::Unavailable(_) => false,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConnectorError::Timeout
        } else if e.is_connect() || e.is_request() {
            ConnectorError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            ConnectorError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_decode() || e.is_body() {
            ConnectorError::Decode(e.to_string())
        } else {
            ConnectorError::Connect(e.to_string())
        }
    }
}

/// Configuration rejected by validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("{field}: exit threshold {exit} must be below entry threshold {entry}")]
    Hysteresis {
        field: &'static str,
        entry: f64,
        exit: f64,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
