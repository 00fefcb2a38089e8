//! Outcome of one reconciliation attempt

use std::fmt;

use fiaas_common::crd::{DeployResult, ObjectRecord, StatusRecord};

use crate::object::ObjectKind;

/// What happened to one derived object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// The object did not exist and was created
    Created,
    /// The live object was updated to the desired state
    Updated,
    /// The live object already matched; nothing was written
    Unchanged,
    /// The kind no longer applies and the live object was removed
    Deleted,
    /// Applying the object failed
    Failed {
        /// Error detail
        error: String,
        /// Whether a later attempt may succeed without a spec change
        retryable: bool,
    },
    /// The attempt was cancelled before this object was reached
    Cancelled,
}

impl ObjectOutcome {
    /// Lowercase name stored in status records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Deleted => "deleted",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the object did not reach its desired state
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Cancelled)
    }
}

impl fmt::Display for ObjectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { error, .. } => write!(f, "failed: {}", error),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome for one named object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectResult {
    /// Object kind
    pub kind: ObjectKind,
    /// Object name
    pub name: String,
    /// What happened
    pub outcome: ObjectOutcome,
}

/// Aggregated outcome of reconciling one application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciliationResult {
    /// Application name
    pub app: String,
    /// Namespace of the application
    pub namespace: String,
    /// Deployment id that was reconciled
    pub deployment_id: String,
    /// Per-object outcomes in apply order
    pub objects: Vec<ObjectResult>,
    /// FAILED if any object failed or was cancelled, else RUNNING
    pub status: DeployResult,
}

impl ReconciliationResult {
    /// Build a result, deriving the overall status from the object outcomes
    pub fn new(
        app: impl Into<String>,
        namespace: impl Into<String>,
        deployment_id: impl Into<String>,
        objects: Vec<ObjectResult>,
    ) -> Self {
        let status = if objects.iter().any(|o| o.outcome.is_failure()) {
            DeployResult::Failed
        } else {
            DeployResult::Running
        };
        Self {
            app: app.into(),
            namespace: namespace.into(),
            deployment_id: deployment_id.into(),
            objects,
            status,
        }
    }

    /// Whether the overall result is RUNNING
    pub fn succeeded(&self) -> bool {
        self.status == DeployResult::Running
    }

    /// Objects that failed or were cancelled
    pub fn failed_objects(&self) -> impl Iterator<Item = &ObjectResult> {
        self.objects.iter().filter(|o| o.outcome.is_failure())
    }

    /// Whether re-running the same spec may succeed: at least one object
    /// failed retryably or was cancelled, and none failed permanently
    pub fn is_retryable(&self) -> bool {
        !self.succeeded()
            && self.failed_objects().all(|o| match &o.outcome {
                ObjectOutcome::Failed { retryable, .. } => *retryable,
                _ => true,
            })
    }

    /// Persistable form of this result
    pub fn to_status_record(&self) -> StatusRecord {
        StatusRecord {
            result: self.status,
            app: self.app.clone(),
            deployment_id: self.deployment_id.clone(),
            objects: self
                .objects
                .iter()
                .map(|o| ObjectRecord {
                    kind: o.kind.as_str().to_string(),
                    name: o.name.clone(),
                    outcome: o.outcome.as_str().to_string(),
                    error: match &o.outcome {
                        ObjectOutcome::Failed { error, .. } => Some(error.clone()),
                        _ => None,
                    },
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(kind: ObjectKind, outcome: ObjectOutcome) -> ObjectResult {
        ObjectResult {
            kind,
            name: "web".to_string(),
            outcome,
        }
    }

    /// Story: one failed object fails the whole result and is named in the record
    #[test]
    fn story_partial_failure_is_failed_overall() {
        let result = ReconciliationResult::new(
            "web",
            "default",
            "d1",
            vec![
                object(ObjectKind::Deployment, ObjectOutcome::Updated),
                object(ObjectKind::Service, ObjectOutcome::Created),
                object(
                    ObjectKind::Ingress,
                    ObjectOutcome::Failed {
                        error: "gave up".to_string(),
                        retryable: false,
                    },
                ),
            ],
        );
        assert_eq!(result.status, DeployResult::Failed);
        assert!(!result.is_retryable());

        let record = result.to_status_record();
        assert_eq!(record.result, DeployResult::Failed);
        assert_eq!(record.objects.len(), 3);
        let failed: Vec<_> = record.objects.iter().filter(|o| o.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, "Ingress");
        assert_eq!(failed[0].outcome, "failed");
    }

    #[test]
    fn unchanged_and_deleted_are_success() {
        let result = ReconciliationResult::new(
            "web",
            "default",
            "d1",
            vec![
                object(ObjectKind::Deployment, ObjectOutcome::Unchanged),
                object(ObjectKind::Autoscaler, ObjectOutcome::Deleted),
            ],
        );
        assert!(result.succeeded());
        assert!(!result.is_retryable());
    }

    #[test]
    fn transient_failures_and_cancellation_are_retryable() {
        let result = ReconciliationResult::new(
            "web",
            "default",
            "d1",
            vec![
                object(
                    ObjectKind::Deployment,
                    ObjectOutcome::Failed {
                        error: "cluster unavailable".to_string(),
                        retryable: true,
                    },
                ),
                object(ObjectKind::Service, ObjectOutcome::Cancelled),
            ],
        );
        assert!(!result.succeeded());
        assert!(result.is_retryable());
    }
}
