use thiserror::Error;

/// Errors surfaced by the session manager's public entry points.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no session found with id {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    SecurityDenied(String),

    #[error("the session manager has been shut down")]
    Disposed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        SessionError::InvalidArgument(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        SessionError::SecurityDenied(msg.into())
    }
}
