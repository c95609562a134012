//! Error taxonomy shared by the orchestrator, the backend adapters and the
//! collaborators they depend on.

use thiserror::Error;

/// Coarse classification of a [`LifecycleError`], surfaced to callers
/// alongside the human readable cause.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Caller input was missing or invalid.
    Validation,
    /// A record is absent from the document store.
    NotFound,
    /// A backend rejected a call or could not be reached.
    Backend,
    /// A backend operation finished in an error state.
    BackendOperation,
    /// A polling budget was exhausted.
    Timeout,
    /// A resource was found in an unexpected state.
    Conflict,
    /// The adapter does not implement the requested primitive.
    NotSupported,
    /// Credentials were missing or incomplete.
    Credential,
    /// The document store failed.
    Store,
    /// Engine configuration was invalid.
    Config,
}

impl ErrorKind {
    /// Returns the stable, lowercase name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Backend => "backend",
            Self::BackendOperation => "backend_operation",
            Self::Timeout => "timeout",
            Self::Conflict => "conflict",
            Self::NotSupported => "not_supported",
            Self::Credential => "credential",
            Self::Store => "store",
            Self::Config => "config",
        }
    }
}

/// Errors raised by volume lifecycle operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Raised before any backend call when caller input is unusable.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when a volume or snapshot record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type, `volume` or `snapshot`.
        entity: String,
        /// Identifier used for the lookup.
        id: String,
    },
    /// Raised when a backend answers with a non-success status.
    #[error("{provider} backend returned {status}: {message}")]
    Backend {
        /// Provider name.
        provider: String,
        /// HTTP status reported by the control plane.
        status: u16,
        /// Body or message returned by the control plane.
        message: String,
    },
    /// Raised when a backend cannot be reached or its answer cannot be read.
    #[error("{provider} backend unreachable: {message}")]
    Transport {
        /// Provider name.
        provider: String,
        /// Underlying transport or decoding failure.
        message: String,
    },
    /// Raised when an asynchronous backend operation completes with an error.
    #[error("operation {operation} failed: {payload}")]
    BackendOperation {
        /// Operation name or handle.
        operation: String,
        /// Error payload reported by the backend.
        payload: String,
    },
    /// Raised when polling never observed the expected state.
    #[error("{resource} did not become {expected} after {attempts} attempts")]
    Timeout {
        /// Resource being polled.
        resource: String,
        /// State the poll was waiting for.
        expected: String,
        /// Number of checks issued.
        attempts: u32,
    },
    /// Raised when a resource is in a state incompatible with the request.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Raised when an adapter lacks the requested primitive.
    #[error("{provider} does not support {operation}")]
    NotSupported {
        /// Provider name.
        provider: String,
        /// Primitive that was requested.
        operation: String,
    },
    /// Raised when credentials cannot be resolved or are incomplete.
    #[error("credential error: {0}")]
    Credential(String),
    /// Raised when the document store fails.
    #[error("store error: {0}")]
    Store(String),
    /// Raised when engine configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LifecycleError {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Backend { .. } | Self::Transport { .. } => ErrorKind::Backend,
            Self::BackendOperation { .. } => ErrorKind::BackendOperation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Credential(_) => ErrorKind::Credential,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true when a backend reported the resource as missing.
    #[must_use]
    pub const fn is_backend_not_found(&self) -> bool {
        matches!(self, Self::Backend { status: 404, .. })
    }

    /// Returns true when a backend reported a name collision.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::Backend { status: 409, .. })
    }

    pub(crate) fn volume_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: String::from("volume"),
            id: id.into(),
        }
    }

    pub(crate) fn snapshot_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: String::from("snapshot"),
            id: id.into(),
        }
    }

    pub(crate) fn not_supported(provider: impl Into<String>, operation: &str) -> Self {
        Self::NotSupported {
            provider: provider.into(),
            operation: operation.to_owned(),
        }
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(value: serde_json::Error) -> Self {
        Self::Store(value.to_string())
    }
}
