/// Error types for the sensor hub storage engine.
///
/// The taxonomy deliberately separates the four failure classes callers need
/// to react to differently: malformed requests (`Validation`), constraint
/// violations (`Integrity`), failures of the underlying store (`Storage`) and
/// oversized join queries (`FanOutExceeded`). "Not found" is never an error;
/// lookups return `Option` instead.
use thiserror::Error;

/// The main error type for hub operations.
///
/// All fallible operations return `Result<T, HubError>`. The variants are
/// designed to be pattern-matched so calling layers can decide on retry,
/// rejection or refinement without string inspection.
#[derive(Error, Debug)]
pub enum HubError {
    /// The request itself is malformed (e.g. an invalid filter combination).
    /// No mutation was attempted.
    #[error("invalid request: {reason}")]
    Validation {
        /// Description of what made the request invalid
        reason: String,
    },

    /// A referential or uniqueness constraint would be violated.
    /// No partial mutation is left behind.
    #[error("integrity violation: {reason}")]
    Integrity {
        /// Description of the violated constraint
        reason: String,
    },

    /// The underlying ordered store failed mid-operation. The store has been
    /// rolled back to its last consistent snapshot before this was raised.
    #[error("storage error: {0}")]
    Storage(String),

    /// A join-style query would fan out across more series or datastreams
    /// than the configured cap allows. The caller should refine the filter;
    /// results are never silently truncated.
    #[error("query fans out across {candidates} candidates, exceeding the cap of {cap}")]
    FanOutExceeded {
        /// Number of candidate series/datastreams the query would touch
        candidates: usize,
        /// The configured fan-out cap
        cap: usize,
    },

    /// A stored record could not be decoded (unknown format version or
    /// corrupt bytes).
    #[error("decode error: {0}")]
    Decode(String),
}

impl HubError {
    /// Create a validation error from anything printable.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create an integrity error from anything printable.
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;
