//! Error types for the fiaas deploy controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the application, object kind or URL it concerns so
//! that the status record and the logs tell the same story.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for deploy controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a conflict nor a connectivity failure
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed application spec (missing or mistyped fields)
    #[error("schema validation error for {app}: {message}")]
    SchemaValidation {
        /// Name of the application whose spec is invalid
        app: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "ports[0].target_port")
        field: Option<String>,
    },

    /// Application spec carries a version tag no normalizer understands
    #[error("unsupported spec version {version} for {app}")]
    UnsupportedVersion {
        /// Name of the application
        app: String,
        /// The version tag as found in the document
        version: String,
    },

    /// A single optimistic-concurrency conflict (stale resourceVersion)
    #[error("conflict applying {kind}/{name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// Conflict retries for one object were exhausted
    #[error("gave up applying {kind}/{name} after {attempts} conflicting attempts")]
    ConflictExhausted {
        /// Kind of the object that could not be applied
        kind: String,
        /// Name of the object that could not be applied
        name: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Transient connectivity failure talking to the cluster
    #[error("cluster unavailable: {message}")]
    ClusterUnavailable {
        /// Description of what failed
        message: String,
    },

    /// Outbound pipeline notification could not be delivered
    #[error("notification to {url} failed: {message}")]
    NotificationDelivery {
        /// Target URL of the notification
        url: String,
        /// Description of what failed
        message: String,
    },

    /// Change rejected because the application is being deleted
    #[error("application {app} is pending deletion")]
    PendingDeletion {
        /// Name of the application
        app: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatcher", "status")
        context: String,
    },
}

impl Error {
    /// Create a schema validation error without application context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::SchemaValidation {
            app: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a schema validation error for an application
    pub fn validation_for(app: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaValidation {
            app: app.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a schema validation error for an application and field path
    pub fn validation_for_field(
        app: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::SchemaValidation {
            app: app.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unsupported version error
    pub fn unsupported_version(app: impl Into<String>, version: impl Into<String>) -> Self {
        Self::UnsupportedVersion {
            app: app.into(),
            version: version.into(),
        }
    }

    /// Create a conflict error for one object
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict-exhausted error for one object
    pub fn conflict_exhausted(kind: impl Into<String>, name: impl Into<String>, attempts: u32) -> Self {
        Self::ConflictExhausted {
            kind: kind.into(),
            name: name.into(),
            attempts,
        }
    }

    /// Create a cluster connectivity error
    pub fn cluster_unavailable(msg: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            message: msg.into(),
        }
    }

    /// Create a notification delivery error
    pub fn notification(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotificationDelivery {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a pending-deletion rejection
    pub fn pending_deletion(app: impl Into<String>) -> Self {
        Self::PendingDeletion { app: app.into() }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
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

    /// Classify a kube-rs error raised while touching one object.
    ///
    /// 409 becomes [`Error::Conflict`], 429/5xx and transport failures become
    /// [`Error::ClusterUnavailable`], everything else stays [`Error::Kube`].
    pub fn from_kube_for_object(
        kind: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name, ae.message),
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
                Self::cluster_unavailable(format!("{} ({})", ae.message, ae.code))
            }
            kube::Error::Api(_) => Self::Kube { source },
            other => Self::cluster_unavailable(other.to_string()),
        }
    }

    /// Whether this is a single optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is retryable at the requeue level
    ///
    /// Spec errors require a new submission, conflicts are already retried
    /// inside apply, so only connectivity problems are requeued.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::SchemaValidation { .. } => false,
            Error::UnsupportedVersion { .. } => false,
            Error::Conflict { .. } => true,
            Error::ConflictExhausted { .. } => false,
            Error::ClusterUnavailable { .. } => true,
            Error::NotificationDelivery { .. } => false,
            Error::PendingDeletion { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error means the submitted spec itself is unusable
    pub fn is_spec_error(&self) -> bool {
        matches!(
            self,
            Error::SchemaValidation { .. } | Error::UnsupportedVersion { .. }
        )
    }

    /// Get the application name if this error is associated with one
    pub fn app(&self) -> Option<&str> {
        match self {
            Error::SchemaValidation { app, .. } => Some(app),
            Error::UnsupportedVersion { app, .. } => Some(app),
            Error::PendingDeletion { app } => Some(app),
            _ => None,
        }
    }
}
