use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;

/// Errors returned by the direct rule engine and the lockdown policy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Chain, rule or lockdown mode is already present/enabled
    #[error("ALREADY_ENABLED: {0}")]
    AlreadyEnabled(String),

    /// Chain, rule or lockdown mode is not present/enabled
    #[error("NOT_ENABLED: {0}")]
    NotEnabled(String),

    /// Malformed input, rejected before any state change
    #[error("INVALID_ARGUMENT: {0}")]
    InvalidArgument(String),

    /// Caller is not whitelisted while lockdown is enabled
    #[error("ACCESS_DENIED: {0}")]
    AccessDenied(String),

    /// The backend failed. Any in-memory mutation that triggered it stays committed.
    #[error("BACKEND_ERROR: {0}")]
    Backend(#[from] BackendError),
}

/// Wire-level classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AlreadyEnabled,
    NotEnabled,
    InvalidArgument,
    AccessDenied,
    BackendError,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyEnabled(_) => ErrorKind::AlreadyEnabled,
            Error::NotEnabled(_) => ErrorKind::NotEnabled,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::Backend(_) => ErrorKind::BackendError,
        }
    }

    /// True when the request was accepted but not reflected in the live filter
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyEnabled => "ALREADY_ENABLED",
            ErrorKind::NotEnabled => "NOT_ENABLED",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::BackendError => "BACKEND_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_message_prefix() {
        let errors = [
            Error::AlreadyEnabled("addChain".into()),
            Error::NotEnabled("removeChain".into()),
            Error::InvalidArgument("empty chain name".into()),
            Error::AccessDenied("lockdown".into()),
            Error::Backend(BackendError::new("iptables-restore failed")),
        ];

        for err in errors {
            assert!(err.to_string().starts_with(err.kind().as_str()));
        }
    }

    #[test]
    fn kind_serializes_as_wire_name() {
        let json = serde_json::to_string(&ErrorKind::AlreadyEnabled).unwrap();
        assert_eq!(json, "\"ALREADY_ENABLED\"");

        let kind: ErrorKind = serde_json::from_str("\"BACKEND_ERROR\"").unwrap();
        assert_eq!(kind, ErrorKind::BackendError);
    }

    #[test]
    fn only_backend_errors_are_divergence() {
        assert!(Error::Backend(BackendError::new("boom")).is_backend());
        assert!(!Error::NotEnabled("x".into()).is_backend());
    }
}
