use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("student has already voted in this poll")]
    DuplicateVote,
    #[error("{0}")]
    Forbidden(String),
    #[error("no free session PIN available")]
    PinExhausted,
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Stable error category sent to clients alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    DuplicateVote,
    Forbidden,
    Unavailable,
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SessionError::NotFound(what.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        SessionError::InvalidState(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        SessionError::Forbidden(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_) => ErrorKind::Validation,
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::InvalidState(_) => ErrorKind::InvalidState,
            SessionError::DuplicateVote => ErrorKind::DuplicateVote,
            SessionError::Forbidden(_) => ErrorKind::Forbidden,
            SessionError::PinExhausted | SessionError::Persistence(_) => ErrorKind::Unavailable,
        }
    }

    /// A repeated vote is a double-click or retry, not a failure worth surfacing.
    pub fn is_benign(&self) -> bool {
        matches!(self, SessionError::DuplicateVote)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_vote_is_the_only_benign_error() {
        assert!(SessionError::DuplicateVote.is_benign());
        assert!(!SessionError::validation("empty title").is_benign());
        assert!(!SessionError::invalid_state("session finished").is_benign());
    }

    #[test]
    fn persistence_failures_map_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = SessionError::from(StoreError::from(io));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("disk full"));
    }
}
