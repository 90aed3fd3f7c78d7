use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the daemon core. The HTTP layer maps these onto
/// status codes; everything else propagates with `?`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("modelfile parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("registry authentication failed: {0}")]
    AuthFailed(String),

    #[error("registry request failed: {0}")]
    Network(String),

    #[error("digest mismatch, expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("failed to tokenize prompt")]
    Tokenize,

    #[error("model evaluation failed: {0}")]
    Eval(String),

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}
