use thiserror::Error;

/// Errors from store operations (used by the store traits in conflux-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A record with the same identity (id or unique key) already exists.
    #[error("duplicate entry: {0}")]
    Duplicate(String),

    /// Lock contention or serialization failure; the transaction may be retried.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");

        let err = RepositoryError::Duplicate("workflow execution 42".to_string());
        assert_eq!(err.to_string(), "duplicate entry: workflow execution 42");
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(RepositoryError::Transient("database is locked".to_string()).is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(!RepositoryError::Duplicate("x".to_string()).is_transient());
        assert!(!RepositoryError::Connection.is_transient());
    }
}
