/// Core error type for the relay.
///
/// Adapter crates map their specific errors into this type so the engine
/// can handle failures consistently (retryable vs. permanent vs. user input).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("session rejected by upstream: {0}")]
    AuthRejected(String),

    #[error("invalid confirmation code")]
    CodeInvalid,

    #[error("confirmation code expired")]
    CodeExpired,

    #[error("invalid cloud password")]
    PasswordInvalid,

    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("no session for user {0}")]
    NoSession(i64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session blob failed authentication")]
    CryptoTampered,

    #[error("permanent upstream error: {0}")]
    Permanent(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Seconds the caller should back off, when the upstream told us.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Error::AuthRejected(_))
    }
}
