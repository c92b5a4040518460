//! Error types for tally-core

use thiserror::Error;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input; reported to the caller immediately, never retried
    #[error("Invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Referenced record absent; reported, not retried
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record with the same identity already exists at the destination
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// Network/backend failure; retried via the sync queue backoff
    #[error("Transport error: {0}")]
    Transport(String),

    /// Concurrent divergent remote change; requires a merge
    #[error("Sync conflict on record {record_id}")]
    Conflict {
        record_id: String,
        /// Snapshot of the divergent remote value
        remote: serde_json::Value,
    },

    /// Missing/invalid backend setup; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sync status moved against the transition table
    #[error("Illegal sync status transition: {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a validation error for a named field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Wrap a failure with the operation it belongs to, e.g.
    /// `"Failed to create record: <reason>"`.
    #[must_use]
    pub fn during(self, operation: &str) -> Self {
        match self {
            Self::Transport(message) => {
                Self::Transport(format!("Failed to {operation}: {message}"))
            }
            Self::Http(error) => Self::Transport(format!("Failed to {operation}: {error}")),
            Self::Sqlite(error) => Self::Transport(format!("Failed to {operation}: {error}")),
            other => other,
        }
    }

    /// True when the failure is transient and worth re-queueing.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn during_prefixes_transport_errors() {
        let error = Error::Transport("connection reset".to_string()).during("create record");
        assert_eq!(
            error.to_string(),
            "Transport error: Failed to create record: connection reset"
        );
    }

    #[test]
    fn during_prefixes_database_errors() {
        let error = Error::Sqlite(rusqlite::Error::InvalidQuery).during("update record");
        assert!(error
            .to_string()
            .starts_with("Transport error: Failed to update record:"));
        assert!(error.is_retryable());
    }

    #[test]
    fn during_leaves_validation_untouched() {
        let error = Error::validation("name", "must not be empty").during("create record");
        assert_eq!(error.to_string(), "Invalid name: must not be empty");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Transport("timeout".to_string()).is_retryable());
        assert!(!Error::NotFound("abc".to_string()).is_retryable());
        assert!(!Error::validation("name", "bad").is_retryable());
    }
}
