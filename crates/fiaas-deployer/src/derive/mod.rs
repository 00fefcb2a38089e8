//! Object derivers
//!
//! Each deriver is a pure function from an [`AppSpec`] and its
//! [`IdentityMetadata`] to one desired cluster object. A deriver that does
//! not apply to a spec says so with [`Derived::NotApplicable`] instead of
//! producing an empty object.

mod autoscaler;
mod deployment;
mod ingress;
mod service;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kube::core::ObjectMeta;

use fiaas_spec::AppSpec;

use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};

pub use autoscaler::AutoscalerDeriver;
pub use deployment::{DeploymentDeriver, DATADOG_CONTAINER_NAME};
pub use ingress::IngressDeriver;
pub use service::ServiceDeriver;

/// Revisions kept for rollback on derived Deployments
pub const REVISION_HISTORY_LIMIT: i32 = 5;

/// Result of running one deriver
#[derive(Clone, Debug, PartialEq)]
pub enum Derived {
    /// The desired object
    Object(ManagedObject),
    /// The application declares nothing for this kind
    NotApplicable,
}

/// Builds one kind of desired object
pub trait Deriver: Send + Sync {
    /// Kind this deriver produces
    fn kind(&self) -> ObjectKind;

    /// Desired object for `app`
    fn derive(&self, app: &AppSpec, identity: &IdentityMetadata) -> Derived;
}

/// Service type for derived Services; a cluster setting, not part of the app spec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceType {
    /// Cluster-internal virtual IP
    #[default]
    ClusterIp,
    /// Exposed on every node
    NodePort,
}

impl ServiceType {
    /// Kubernetes spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide settings shared by the derivers
#[derive(Clone, Debug, Default)]
pub struct DeriverConfig {
    /// Type of derived Services
    pub service_type: ServiceType,
    /// Domains appended to the app name for host-less ingress rules
    pub ingress_suffixes: Vec<String>,
    /// `ingressClassName` on derived Ingresses
    pub ingress_class: Option<String>,
    /// Extra environment variables for every application container
    pub global_env: Vec<(String, String)>,
    /// Environment name exposed as `FIAAS_ENVIRONMENT`
    pub environment: String,
    /// Infrastructure name exposed as `FIAAS_INFRASTRUCTURE`
    pub infrastructure: String,
    /// Image for the datadog sidecar; sidecars are skipped when unset
    pub datadog_image: Option<String>,
}

/// One deriver per kind, in apply order
pub fn default_derivers(config: &DeriverConfig) -> Vec<Box<dyn Deriver>> {
    let config = Arc::new(config.clone());
    vec![
        Box::new(DeploymentDeriver::new(config.clone())),
        Box::new(ServiceDeriver::new(config.clone())),
        Box::new(IngressDeriver::new(config)),
        Box::new(AutoscalerDeriver),
    ]
}

/// Metadata for an object owned by `app`
fn object_meta(
    kind: ObjectKind,
    app: &AppSpec,
    labels: BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(kind.object_name(&app.name)),
        namespace: Some(app.namespace.clone()),
        labels: Some(labels),
        annotations: (!annotations.is_empty()).then(|| annotations.clone()),
        ..Default::default()
    }
}

/// Counts in an AppSpec are bounded far below i32::MAX
fn int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
pub(crate) mod test_support {
    use fiaas_spec::{normalize, AppSpec, RawSpecDocument};
    use serde_json::Value;

    pub fn app(config: Value) -> AppSpec {
        normalize(&RawSpecDocument::new(
            "web",
            "default",
            "registry.io/team/web:1.2",
            "d1",
            config,
        ))
        .unwrap()
    }
}
