//! Muninn error types

/// Muninn error types
#[derive(Debug, thiserror::Error)]
pub enum MuninnError {
    // Invariant violations: a broker or store hierarchy is misconfigured.
    #[error("ownership mismatch: expected {expected}, found {found}")]
    OwnershipMismatch { expected: String, found: String },

    #[error("cache path already contains an entry for {entity}")]
    DuplicatePathEntry { entity: &'static str },

    #[error("cache path has no entry for {entity}")]
    MissingPathEntry { entity: &'static str },

    #[error("handle for {entity} is not owned by this reference")]
    HandleNotOwned { entity: &'static str },

    /// A model was handed to a broker that neither constructs it itself nor
    /// routes it to a sub-broker.
    #[error("broker for {broker} does not own model kind '{kind}'")]
    NotOwned { broker: &'static str, kind: String },

    #[error("model kind '{kind}' has more than one owner in the {entity} hierarchy")]
    AmbiguousOwner { entity: &'static str, kind: String },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    // Collaborator errors, passed through untouched
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for lock on {key}")]
    LockTimeout { key: String },

    // Lifecycle and configuration
    #[error("state controller has shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("entity construction failed: {0}")]
    Construction(String),
}

impl MuninnError {
    /// Whether this error indicates a misconfigured broker/store hierarchy or
    /// a broken caller contract.
    ///
    /// These are never retried and should surface immediately.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            MuninnError::OwnershipMismatch { .. }
                | MuninnError::DuplicatePathEntry { .. }
                | MuninnError::MissingPathEntry { .. }
                | MuninnError::HandleNotOwned { .. }
                | MuninnError::NotOwned { .. }
                | MuninnError::AmbiguousOwner { .. }
                | MuninnError::TypeMismatch { .. }
        )
    }

    /// Whether a caller may reasonably retry the operation.
    ///
    /// The cache itself never retries; this is a hint for callers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MuninnError::Store(_) | MuninnError::Io(_) | MuninnError::LockTimeout { .. }
        )
    }

    pub(crate) fn ownership(expected: impl Into<String>, found: impl Into<String>) -> Self {
        MuninnError::OwnershipMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Result type alias for Muninn operations
pub type Result<T> = std::result::Result<T, MuninnError>;
