/// Errors produced by the distribution client and the layout store.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid manifest headers: {0}")]
    InvalidManifestHeaders(String),

    #[error("transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("incompatible image layout: {0}")]
    IncompatibleLayout(String),

    #[error("delete not supported: {0}")]
    DeleteNotSupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// Build a transport error that records the HTTP status it came from.
    pub fn transport_status(status: u16, message: impl Into<String>) -> Self {
        OciError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// The HTTP status code carried by a transport error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            OciError::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OciError {
    fn from(err: reqwest::Error) -> Self {
        OciError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<reqwest_middleware::Error> for OciError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => OciError::Transport {
                status: None,
                message: e.to_string(),
            },
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
