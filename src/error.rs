//! Error types for the Ghost operator
//!
//! Errors carry enough context (dependent kind, operation, object name) for the
//! scheduler to log them and decide on backoff. NotFound is never an error here:
//! reads return `Option` and absence drives the create path.

use std::fmt;

use thiserror::Error;

/// Placeholder for errors raised before the owning Ghost is known
const UNKNOWN_CONTEXT: &str = "unknown";

/// Dependent resource kinds managed on behalf of a Ghost
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependentKind {
    /// PersistentVolumeClaim holding the blog content database
    PersistentVolumeClaim,
    /// Deployment running the Ghost container
    Deployment,
    /// NodePort Service exposing the blog
    Service,
}

impl DependentKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store operation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// get or list
    Read,
    /// create
    Create,
    /// update (replace)
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
        })
    }
}

/// Main error type for Ghost operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API or transport error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency collision (HTTP 409)
    #[error("conflict on {kind} {name}")]
    Conflict {
        /// Kind of the conflicting object
        kind: String,
        /// Name of the conflicting object
        name: String,
    },

    /// Missing or malformed packaged manifest
    #[error("manifest error [{path}]: {message}")]
    Manifest {
        /// Template path that failed
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Ghost spec is not usable
    #[error("validation error for {ghost}: {message}")]
    Validation {
        /// namespace/name of the Ghost
        ghost: String,
        /// Description of what's invalid
        message: String,
    },

    /// Owner reference could not be built or set
    #[error("owner reference error: {0}")]
    OwnerReference(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A cluster API call exceeded the configured timeout
    #[error("timed out during {operation}")]
    Timeout {
        /// The call that timed out
        operation: String,
    },

    /// Reconciliation was cancelled (shutdown)
    #[error("reconciliation cancelled")]
    Cancelled,

    /// A store error annotated with the dependent kind and operation
    #[error("{op} {kind} failed: {source}")]
    Dependent {
        /// Dependent kind being converged
        kind: DependentKind,
        /// Operation that failed
        op: Operation,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a manifest error for the given template path
    pub fn manifest(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error not yet tied to a Ghost
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_for(UNKNOWN_CONTEXT, msg)
    }

    /// Create a validation error for the given Ghost
    pub fn validation_for(ghost: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            ghost: ghost.into(),
            message: msg.into(),
        }
    }

    /// Attach the Ghost's `namespace/name` to a validation error
    pub fn for_ghost(self, ghost: impl Into<String>) -> Self {
        match self {
            Self::Validation { message, .. } => Self::Validation {
                ghost: ghost.into(),
                message,
            },
            other => other,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Annotate this error with the dependent kind and operation that produced it
    pub fn during(self, kind: DependentKind, op: Operation) -> Self {
        Self::Dependent {
            kind,
            op,
            source: Box::new(self),
        }
    }

    /// Map a kube error, turning HTTP 409 into [`Error::Conflict`]
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => Self::conflict(kind, name),
            other => Self::Kube(other),
        }
    }

    /// Check if this error is retryable
    ///
    /// Manifest, validation, owner-reference and serialization errors indicate a
    /// deployment defect or a spec that must change first. Everything else,
    /// including conflicts, timeouts and cancellation, is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_) => true,
            Error::Conflict { .. } => true,
            Error::Manifest { .. } => false,
            Error::Validation { .. } => false,
            Error::OwnerReference(_) => false,
            Error::Serialization(_) => false,
            Error::Timeout { .. } => true,
            Error::Cancelled => true,
            Error::Dependent { source, .. } => source.is_retryable(),
        }
    }

    /// Whether this error, or the error it wraps, is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Dependent { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Dependent kind this error is attributed to, if any
    pub fn dependent_kind(&self) -> Option<DependentKind> {
        match self {
            Error::Dependent { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
