use thiserror::Error;

/// Prefix the log service uses to signal that a query mechanism is not
/// offered (e.g. no full-text index plugin is loaded).
pub const UNAVAILABLE_PREFIX: &str = "no source";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The preferred query mechanism does not exist on this log service.
    /// Recoverable by degrading to a fallback mechanism.
    #[error("no source {0}")]
    Unavailable(String),

    /// Any other failure. Terminal for the stream that raised it.
    #[error("{0}")]
    Terminated(String),
}

impl QueryError {
    pub fn unavailable(capability: impl Into<String>) -> Self {
        Self::Unavailable(capability.into())
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::Terminated(message.into())
    }

    /// Classify a raw error message the way the original client did: only
    /// messages starting with the "no source" signature drive fallback.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some(rest) = message.strip_prefix(UNAVAILABLE_PREFIX) {
            Self::Unavailable(rest.trim().to_string())
        } else {
            Self::Terminated(message)
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
