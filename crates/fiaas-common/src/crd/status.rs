//! Per-deployment status resources
//!
//! One status resource exists per (application, deployment id). It is written
//! once when the reconciliation for that deployment id finishes and
//! overwritten only if the same deployment id is reconciled again.

use std::collections::BTreeMap;
use std::fmt;

use kube::core::ObjectMeta;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::SpecSource;
use crate::kube_utils::{label_value, status_name};
use crate::{APP_LABEL, DEPLOYMENT_ID_LABEL};

/// Overall result of one reconciliation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeployResult {
    /// Every derived object is applied
    Running,
    /// At least one derived object failed or the attempt was cancelled
    Failed,
}

impl DeployResult {
    /// Label value used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeployResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
        })
    }
}

/// Outcome of one derived object as persisted in the status record
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Object kind (e.g. "Ingress")
    pub kind: String,
    /// Object name
    pub name: String,
    /// created, updated, unchanged, deleted, failed or cancelled
    pub outcome: String,
    /// Error detail when the object failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted outcome of one reconciliation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// Overall result
    pub result: DeployResult,
    /// Application name
    pub app: String,
    /// Deployment id this record belongs to
    pub deployment_id: String,
    /// Per-object outcomes in apply order
    #[serde(default)]
    pub objects: Vec<ObjectRecord>,
}

/// Specification for an ApplicationStatus
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fiaas.schibsted.io",
    version = "v1",
    kind = "ApplicationStatus",
    plural = "application-statuses",
    namespaced,
    printcolumn = r#"{"name":"Result","type":"string","jsonPath":".spec.result"}"#,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ApplicationStatusSpec {
    /// The persisted record
    #[serde(flatten)]
    pub record: StatusRecord,
}

/// Specification for a legacy PaasbetaStatus
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "schibsted.io",
    version = "v1beta",
    kind = "PaasbetaStatus",
    plural = "paasbetastatuses",
    namespaced
)]
pub struct PaasbetaStatusSpec {
    /// The persisted record
    #[serde(flatten)]
    pub record: StatusRecord,
}

/// Common view over both status flavors
pub trait StatusResource:
    Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Flavor this kind belongs to
    const SOURCE: SpecSource;

    /// Wrap a record with its metadata
    fn from_parts(metadata: ObjectMeta, record: StatusRecord) -> Self;

    /// The persisted record
    fn record(&self) -> &StatusRecord;

    /// Build the status resource for `record` in `namespace`
    fn for_record(namespace: &str, record: StatusRecord) -> Self {
        let metadata = ObjectMeta {
            name: Some(status_name(&record.app, &record.deployment_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (APP_LABEL.to_string(), record.app.clone()),
                (
                    DEPLOYMENT_ID_LABEL.to_string(),
                    label_value(&record.deployment_id),
                ),
            ])),
            ..Default::default()
        };
        Self::from_parts(metadata, record)
    }
}

impl StatusResource for ApplicationStatus {
    const SOURCE: SpecSource = SpecSource::Modern;

    fn from_parts(metadata: ObjectMeta, record: StatusRecord) -> Self {
        Self {
            metadata,
            spec: ApplicationStatusSpec { record },
        }
    }

    fn record(&self) -> &StatusRecord {
        &self.spec.record
    }
}

impl StatusResource for PaasbetaStatus {
    const SOURCE: SpecSource = SpecSource::Legacy;

    fn from_parts(metadata: ObjectMeta, record: StatusRecord) -> Self {
        Self {
            metadata,
            spec: PaasbetaStatusSpec { record },
        }
    }

    fn record(&self) -> &StatusRecord {
        &self.spec.record
    }
}
