//! Service deriver

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use fiaas_spec::AppSpec;

use super::{object_meta, Derived, Deriver, DeriverConfig};
use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};

/// Builds the application's Service. Not applicable without ports.
pub struct ServiceDeriver {
    config: Arc<DeriverConfig>,
}

impl ServiceDeriver {
    /// Create a deriver using the shared cluster settings
    pub fn new(config: Arc<DeriverConfig>) -> Self {
        Self { config }
    }
}

impl Deriver for ServiceDeriver {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Service
    }

    fn derive(&self, app: &AppSpec, identity: &IdentityMetadata) -> Derived {
        if app.ports.is_empty() {
            return Derived::NotApplicable;
        }
        let ports = app
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(p.name.clone()),
                port: i32::from(p.port),
                target_port: Some(IntOrString::Int(i32::from(p.target_port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        Derived::Object(ManagedObject::Service(Service {
            metadata: object_meta(
                ObjectKind::Service,
                app,
                identity.labels_with(&app.labels.service),
                &app.annotations.service,
            ),
            spec: Some(ServiceSpec {
                type_: Some(self.config.service_type.as_str().to_string()),
                // the selector only, so pods stay matched across relabeling
                selector: Some(identity.selector.clone()),
                ports: Some(ports),
                session_affinity: Some("None".to_string()),
                ..Default::default()
            }),
            status: None,
        }))
    }
}
