//! Common types for the fiaas deploy controller: CRDs, errors, telemetry and
//! Kubernetes helpers shared by the spec, deployer and operator crates

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fiaas-deploy-daemon";

/// Identity string reported to external systems and as `fiaas/deployed_by`
pub const CONTROLLER_NAME: &str = "fiaas-deploy-daemon";

/// Label key selecting every object belonging to one application
pub const APP_LABEL: &str = "app";

/// Label key carrying the application version (image tag)
pub const VERSION_LABEL: &str = "fiaas/version";

/// Label key carrying the controller version that applied the object
pub const DEPLOYED_BY_LABEL: &str = "fiaas/deployed_by";

/// Label key carrying the deployment id of the last reconciliation
pub const DEPLOYMENT_ID_LABEL: &str = "fiaas/deployment_id";

/// Annotation on an application resource naming the pipeline callback URL
/// for its deployment id
pub const CALLBACK_URL_ANNOTATION: &str = "fiaas/callback_url";
