use thiserror::Error;

/// Main error type for fpindex operations
#[derive(Error, Debug)]
pub enum FpindexError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Database is already closed")]
    AlreadyClosed,

    #[error("Transaction is already committed or rolled back")]
    TransactionDone,

    #[error("Commit conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fpindex operations
pub type Result<T> = std::result::Result<T, FpindexError>;

impl FpindexError {
    /// Check if this error is a commit conflict that can be retried
    /// from a fresh snapshot.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FpindexError::Conflict(_))
    }

    /// Check if this error means a file was missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            FpindexError::NotFound(_) => true,
            FpindexError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FpindexError::Conflict("segment 3 was already removed".to_string());
        assert_eq!(
            err.to_string(),
            "Commit conflict: segment 3 was already removed"
        );
    }

    #[test]
    fn test_conflict_predicate() {
        assert!(FpindexError::Conflict("x".to_string()).is_conflict());
        assert!(!FpindexError::AlreadyClosed.is_conflict());
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(FpindexError::NotFound("manifest.json".to_string()).is_not_found());
        let io = FpindexError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_not_found());
        assert!(!FpindexError::TransactionDone.is_not_found());
    }
}
