use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Timeout,
    Http(u16),
    Unauthorized,
    Network,
    MalformedResponse,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Timeout => f.write_str("timeout"),
            BackendErrorKind::Http(status) => write!(f, "http {status}"),
            BackendErrorKind::Unauthorized => f.write_str("unauthorized"),
            BackendErrorKind::Network => f.write_str("network"),
            BackendErrorKind::MalformedResponse => f.write_str("malformed response"),
        }
    }
}

/// Failure of a single inference call, normalised at the client boundary.
#[derive(Debug, Clone, Error)]
#[error("backend '{backend}' failed ({kind}): {message}")]
pub struct BackendError {
    pub backend: String,
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(
        backend: impl Into<String>,
        kind: BackendErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(backend: impl Into<String>, after: std::time::Duration) -> Self {
        Self::new(
            backend,
            BackendErrorKind::Timeout,
            format!("no response within {}s", after.as_secs_f64()),
        )
    }

    pub fn from_reqwest(backend: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            BackendErrorKind::Timeout
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => BackendErrorKind::Unauthorized,
                code => BackendErrorKind::Http(code),
            }
        } else if err.is_decode() {
            BackendErrorKind::MalformedResponse
        } else {
            BackendErrorKind::Network
        };
        Self::new(backend, kind, err.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == BackendErrorKind::Timeout
    }
}

/// Outcome of a routing attempt. Only `Backend` failures are eligible for fallback.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RouteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouteError::Backend(_))
    }
}
