//! Error types for tack-core

use thiserror::Error;

/// Result type alias using tack-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tack-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Mutation attempted by someone other than the note's author.
    /// Never retried.
    #[error("Note {id} is owned by {owner}; {caller} may not modify it")]
    Ownership {
        id: String,
        owner: String,
        caller: String,
    },

    /// Transport failure, timeout, or 5xx from the collaboration gateway.
    /// Triggers the offline transition instead of failing the caller.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed input (absolute path, missing identity, bad URL).
    /// Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Concurrent divergent state that the resolver could not settle
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Note not found
    #[error("Note not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error should push a wrapped backend into offline mode.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return Self::Connectivity(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return Self::Connectivity(err.to_string());
            }
        }
        if err.is_decode() {
            return Self::Validation(format!("invalid response payload: {err}"));
        }
        Self::Connectivity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_message_names_both_parties() {
        let err = Error::Ownership {
            id: "n1".to_string(),
            owner: "alice".to_string(),
            caller: "bob".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("bob"));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::Connectivity("connection refused".into()).is_connectivity());
        assert!(!Error::Validation("bad path".into()).is_connectivity());
    }
}
