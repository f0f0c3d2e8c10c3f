use thiserror::Error;

/// Errors produced while talking to the ProKnow API.
///
/// HTTP failures carry the status code and the response body verbatim so that
/// callers can tell a conflict (409) from a missing resource (404) or a
/// validation failure (422).
#[derive(Debug, Error)]
pub enum ProKnowError {
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("{0}")]
    InvalidPath(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("{0}")]
    WorkspaceLookup(String),
    #[error("{0}")]
    CustomMetricLookup(String),
    #[error("{0}")]
    ScorecardTemplateLookup(String),
    #[error("{0}")]
    TimeoutExceeded(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl ProKnowError {
    /// The HTTP status code, when the error came from a non-2xx response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProKnowError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub(crate) fn not_editable() -> Self {
        ProKnowError::InvalidOperation("Item is not editable".to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProKnowError>;
