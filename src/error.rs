//! Error taxonomy for the runtime.
//!
//! Transport-level failures that break a precondition (auth, rate limit,
//! server error, network) are raised as [`BotError`]. Ordinary application
//! rejections come back as a failed [`crate::http::ApiResponse`] instead.

use std::time::Duration;

use thiserror::Error;

/// Every error the runtime can raise.
#[derive(Error, Debug)]
pub enum BotError {
    /// The server rejected our credentials (HTTP 401 or gateway close 4004).
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// HTTP 429. `global` is set when the whole token is throttled.
    #[error("rate limited on {route}, retry after {retry_after:?}")]
    RateLimited {
        route: String,
        retry_after: Duration,
        global: bool,
    },

    /// Timeout, connect failure, DNS, aborted body read.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 5xx.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// An ordinary application-level rejection, surfaced as an error by
    /// convenience helpers that need the payload (see
    /// [`crate::http::ApiResponse::into_data`]).
    #[error("request rejected ({code:?}): {message}")]
    Rejected { code: Option<u32>, message: String },

    /// The gateway broke its own contract (e.g. a sequence number went
    /// backwards).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// `send` was called without an open gateway connection.
    #[error("gateway is not connected")]
    NotConnected,

    /// The session was torn down while a caller was waiting on it.
    #[error("gateway disconnected")]
    Disconnected,

    /// A connect attempt is already in flight.
    #[error("gateway connect already in progress")]
    AlreadyConnecting,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A command name or alias is already taken.
    #[error("command name or alias `{0}` is already registered")]
    DuplicateCommand(String),

    /// A middleware invoked its continuation more than once.
    #[error("middleware called next() more than once (index {0})")]
    NextCalledTwice(usize),

    #[error("plugin `{name}` failed: {message}")]
    Plugin { name: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// Free-form failure raised by a command handler or job.
    #[error("{0}")]
    Handler(String),
}

impl BotError {
    /// Convenience constructor for handler code.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Network(_)
                | Self::Server { .. }
                | Self::Disconnected
                | Self::Timeout(_)
        )
    }

    /// Suggested delay before retrying, if the server told us one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        // Every reqwest failure that reaches us is a transport problem;
        // status codes are classified separately.
        Self::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Result alias used across the crate.
pub type BotResult<T> = Result<T, BotError>;
