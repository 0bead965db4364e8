/// Error types for memoric operations.
///
/// The error taxonomy keeps "absent", "failed", and "rejected" distinguishable:
/// lookups that legitimately miss return `NotFound`, referential-integrity
/// rejections return `InvalidEndpoint`, and infrastructure failures surface as
/// `Io` or `Corrupt`. Cache and working-memory misses are not errors at all -
/// those lookups return `Option<T>`.
use thiserror::Error;

/// The main error type for memory engine operations.
///
/// All fallible operations return `Result<T, MemoryError>`, aliased as
/// [`MemoryResult`] throughout the crate.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Record not found in the specified collection
    #[error("Record '{id}' not found in collection '{collection}'")]
    NotFound {
        /// The collection that was queried
        collection: String,
        /// The id that was not found
        id: String,
    },

    /// A relationship referenced a concept that does not exist.
    ///
    /// Rejected before any state is touched - no partial edge is ever
    /// created or persisted.
    #[error("Relationship '{relationship}' references missing concept '{missing}'")]
    InvalidEndpoint {
        /// Human-readable description of the rejected relationship
        relationship: String,
        /// The concept id that could not be resolved
        missing: String,
    },

    /// Persistence unavailable or a write could not be durably recorded.
    ///
    /// The store's prior state is left intact when this is returned.
    #[error("I/O failure during {context}: {source}")]
    Io {
        /// What the engine was doing when the failure occurred
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Snapshot restore failed a structural check and was refused wholesale.
    #[error("Corrupt snapshot: {reason}")]
    Corrupt {
        /// Which structural check failed
        reason: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid argument or record shape
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of why the input is invalid
        reason: String,
    },
}

impl MemoryError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a `NotFound` for a collection lookup.
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// Result type alias for memory engine operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
