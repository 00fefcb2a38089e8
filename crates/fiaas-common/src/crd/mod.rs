//! Custom Resource Definitions for the deploy controller
//!
//! Two flavors carry the same payload: the modern `fiaas.schibsted.io/v1`
//! resources and the legacy `schibsted.io/v1beta` ones. [`SpecSource`] selects
//! which pair the controller watches and writes status to.

mod application;
mod status;

pub use application::{
    Application, ApplicationResource, ApplicationSpec, PaasbetaApplication,
    PaasbetaApplicationSpec, SpecSource, UNKNOWN_DEPLOYMENT_ID,
};
pub use status::{
    ApplicationStatus, ApplicationStatusSpec, DeployResult, ObjectRecord, PaasbetaStatus,
    PaasbetaStatusSpec, StatusRecord, StatusResource,
};
