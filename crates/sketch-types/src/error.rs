use thiserror::Error;

pub type SketchResult<T> = Result<T, SketchError>;

/// Error taxonomy shared by the gateway and the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SketchError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("store unavailable")]
    TransientStore(String),
}

impl SketchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Wrap a persistence failure. The cause is kept for logs only.
    pub fn store(cause: impl std::fmt::Display) -> Self {
        Self::TransientStore(cause.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth_error",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::TransientStore(_) => "store_unavailable",
        }
    }

    /// Whether the connection that caused this error must be closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}
