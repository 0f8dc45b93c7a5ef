//! Error types.

/// Errors reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A uniqueness constraint was violated (e.g. `add` on an existing key).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A named collection, index or database does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A value or key was unusable (missing in-line key, invalid key type).
    #[error("data error: {0}")]
    Data(String),

    /// A write was issued in a read-only transaction.
    #[error("read-only transaction: {0}")]
    ReadOnly(String),

    /// The owning transaction was aborted.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// The object was used after it finished or closed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A session requested a version older than the stored one.
    #[error("version error: {0}")]
    Version(String),

    /// Any other engine failure.
    #[error("engine error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to callers of the client API.
///
/// Cloneable because a single batch failure is delivered to every
/// unsettled operation of that batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StashError {
    /// An individual operation's request reported an error.
    #[error("request failed: {0}")]
    RequestFailed(EngineError),

    /// The shared transaction of the operation's batch was aborted.
    #[error("transaction aborted: {0}")]
    TransactionAborted(EngineError),

    /// The engine could not open a session or apply a schema upgrade.
    #[error("engine failure: {0}")]
    Engine(EngineError),

    /// The API was used outside its contract.
    #[error("usage error: {0}")]
    Usage(String),

    /// Serialization or deserialization of a typed value failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StashError {
    /// The engine error behind this failure, if any.
    #[must_use]
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::RequestFailed(e) | Self::TransactionAborted(e) | Self::Engine(e) => Some(e),
            Self::Usage(_) | Self::Serialization(_) => None,
        }
    }

    /// Whether the failure was a constraint violation.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        matches!(self.engine_error(), Some(EngineError::Constraint(_)))
    }
}

/// Result type for client operations.
pub type StashResult<T> = Result<T, StashError>;
