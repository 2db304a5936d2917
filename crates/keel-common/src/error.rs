//! Error types for keel lifecycle operations
//!
//! Errors are grouped by how a caller reacts to them: incompatibilities are
//! shown to the operator, convergence errors are retried, conflicts are
//! re-read and retried, and failures abort the current invocation while
//! leaving persisted progress untouched.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that did not map onto a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A named object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind (e.g., "Restore", "ConfigMap")
        kind: String,
        /// Object name, including namespace when relevant
        name: String,
    },

    /// Creation raced with another writer, or was re-run after a crash
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Optimistic concurrency failure on update
    #[error("failed to update {kind} {name:?}: conflict")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Invalid user input or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The flag or field at fault (e.g., "--s3-endpoint")
        field: Option<String>,
    },

    /// A backup cannot be restored by the running binary
    #[error("backup {backup:?} {reason}")]
    Incompatible {
        /// Name of the rejected backup
        backup: String,
        /// Operator-facing reason, including remediation flags when known
        reason: String,
    },

    /// Every candidate backup was rejected
    #[error("{summary}")]
    NoRestorableBackups {
        /// One line per rejected backup, prefixed with a count header
        summary: String,
    },

    /// A dependent subsystem has not converged yet
    #[error("{message}")]
    InProgress {
        /// Resource being waited on
        resource: String,
        /// Description of the pending condition
        message: String,
    },

    /// A resource reached a terminal failure state
    #[error("{resource}: {message}")]
    Failed {
        /// Resource that failed (e.g., "restore backup-1.app", "autopilot plan")
        resource: String,
        /// Description of the failure
        message: String,
    },

    /// A bounded wait ran out of budget
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Last observed error, or a generic description
        message: String,
    },

    /// The invocation was cancelled while waiting
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited on
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The operator chose to stop; there is nothing else to do
    #[error("{reason}")]
    Stopped {
        /// Why the operation stopped
        reason: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "restore", "upgrade")
        context: String,
    },
}

impl Error {
    /// Map a kube-rs error for a named object onto the taxonomy.
    ///
    /// 404 becomes `NotFound`, 409 with reason `AlreadyExists` becomes
    /// `AlreadyExists`, any other 409 becomes `Conflict`.
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.into(),
                name: name.into(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.into(),
                    name: name.into(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind: kind.into(),
                name: name.into(),
            },
            _ => Self::Kube { source },
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a specific flag or field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an incompatibility error for a backup
    pub fn incompatible(backup: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Incompatible {
            backup: backup.into(),
            reason: reason.into(),
        }
    }

    /// Create a retryable convergence error
    pub fn in_progress(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InProgress {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a terminal failure for a named resource
    pub fn failed(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Failed {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a "nothing else to do" error that callers treat as a clean exit
    pub fn stopped(reason: impl Into<String>) -> Self {
        Self::Stopped {
            reason: reason.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Convergence and conflict errors are retried by an outer loop.
    /// Incompatibilities, terminal failures and timeouts need operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::InProgress { .. } => true,
            Error::Conflict { .. } => true,
            Error::Internal { .. } => true,
            Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::Validation { .. }
            | Error::Incompatible { .. }
            | Error::NoRestorableBackups { .. }
            | Error::Failed { .. }
            | Error::Timeout { .. }
            | Error::Cancelled { .. }
            | Error::Serialization { .. }
            | Error::Stopped { .. } => false,
        }
    }

    /// True for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for `AlreadyExists`
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True for `Conflict`
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when the operator chose to stop
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
