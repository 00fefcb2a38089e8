//! Ingress deriver

use std::sync::Arc;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule as K8sIngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};

use fiaas_spec::AppSpec;

use super::{object_meta, Derived, Deriver, DeriverConfig};
use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};

/// Builds the application's Ingress. Not applicable without ingress rules.
pub struct IngressDeriver {
    config: Arc<DeriverConfig>,
}

impl IngressDeriver {
    /// Create a deriver using the shared cluster settings
    pub fn new(config: Arc<DeriverConfig>) -> Self {
        Self { config }
    }

    /// Hosts a rule is served on: the explicit host, or one generated host
    /// per configured suffix, or no host at all
    fn hosts(&self, app: &AppSpec, host: Option<&str>) -> Vec<Option<String>> {
        match host {
            Some(host) => vec![Some(host.to_string())],
            None if self.config.ingress_suffixes.is_empty() => vec![None],
            None => self
                .config
                .ingress_suffixes
                .iter()
                .map(|suffix| Some(format!("{}.{}", app.name, suffix)))
                .collect(),
        }
    }
}

impl Deriver for IngressDeriver {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Ingress
    }

    fn derive(&self, app: &AppSpec, identity: &IdentityMetadata) -> Derived {
        if app.ingress.is_empty() {
            return Derived::NotApplicable;
        }

        let mut rules = Vec::new();
        for rule in &app.ingress {
            for host in self.hosts(app, rule.host.as_deref()) {
                let path = HTTPIngressPath {
                    path: Some(rule.path.clone()),
                    path_type: "ImplementationSpecific".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: ObjectKind::Service.object_name(&app.name),
                            port: Some(ServiceBackendPort {
                                number: Some(i32::from(rule.port)),
                                name: None,
                            }),
                        }),
                        resource: None,
                    },
                };
                rules.push(K8sIngressRule {
                    host,
                    http: Some(HTTPIngressRuleValue { paths: vec![path] }),
                });
            }
        }

        Derived::Object(ManagedObject::Ingress(Ingress {
            metadata: object_meta(
                ObjectKind::Ingress,
                app,
                identity.labels_with(&app.labels.ingress),
                &app.annotations.ingress,
            ),
            spec: Some(IngressSpec {
                ingress_class_name: self.config.ingress_class.clone(),
                rules: Some(rules),
                ..Default::default()
            }),
            status: None,
        }))
    }
}
