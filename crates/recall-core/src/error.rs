use thiserror::Error;

/// A convenience `Result` alias using [`RecallError`].
pub type RecallResult<T> = Result<T, RecallError>;

/// Top-level error type for the retrieval engine.
///
/// The first five variants form the engine's failure taxonomy; the rest cover
/// input validation and the storage/configuration plumbing around it.
#[derive(Error, Debug)]
pub enum RecallError {
    /// A vector's length does not match the collection dimension. Caller bug.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the collection was configured with.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// The embedding provider failed, timed out, or was cancelled.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted access to a record owned by a different tenant.
    #[error("Owner mismatch: requested by {requested}, owned by {actual}")]
    OwnerMismatch {
        /// The owner that issued the request.
        requested: String,
        /// The owner the record actually belongs to.
        actual: String,
    },

    /// An internal index invariant was violated (e.g. a dangling edge).
    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    /// Rejected caller input (empty text, bad topic, malformed metadata).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A durable record store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecallError {
    /// Whether the failure has a defined degraded path instead of being fatal.
    pub fn is_degradable(&self) -> bool {
        matches!(self, RecallError::EmbeddingUnavailable(_))
    }

    /// Whether the failure is a tenant-isolation violation.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, RecallError::OwnerMismatch { .. })
    }

    /// Builds a [`RecallError::DimensionMismatch`] if `actual != expected`.
    pub fn check_dimension(expected: usize, actual: usize) -> RecallResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(RecallError::DimensionMismatch { expected, actual })
        }
    }
}
