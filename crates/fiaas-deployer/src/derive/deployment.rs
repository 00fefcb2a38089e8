//! Deployment deriver

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource, ExecAction, HTTPGetAction,
    HTTPHeader, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe as K8sProbe,
    ResourceRequirements, SecretEnvSource, SecretKeySelector, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use tracing::warn;

use fiaas_spec::{AppSpec, Probe, ProbeAction, ResourceValues, Resources};

use super::{int, object_meta, Derived, Deriver, DeriverConfig, REVISION_HISTORY_LIMIT};
use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};

/// Name of the datadog agent sidecar container
pub const DATADOG_CONTAINER_NAME: &str = "fiaas-datadog-container";

const DATADOG_API_KEY_SECRET: &str = "datadog";

/// Builds the application's Deployment
pub struct DeploymentDeriver {
    config: Arc<DeriverConfig>,
}

impl DeploymentDeriver {
    /// Create a deriver using the shared cluster settings
    pub fn new(config: Arc<DeriverConfig>) -> Self {
        Self { config }
    }

    fn env(&self, app: &AppSpec) -> Vec<EnvVar> {
        let mut env = vec![
            env_var("ARTIFACT_NAME", &app.name),
            env_var("IMAGE", &app.image),
            env_var("VERSION", &app.version),
            env_var("FIAAS_ENVIRONMENT", &self.config.environment),
            env_var("FIAAS_INFRASTRUCTURE", &self.config.infrastructure),
            field_ref("FIAAS_NAMESPACE", "metadata.namespace"),
            field_ref("FIAAS_POD_NAME", "metadata.name"),
        ];
        for (name, value) in &self.config.global_env {
            // built-in variables are not overridable
            if env.iter().any(|e| &e.name == name) {
                continue;
            }
            env.push(env_var(name, value));
        }
        env
    }

    fn app_container(&self, app: &AppSpec) -> Container {
        let ports: Vec<ContainerPort> = app
            .ports
            .iter()
            .map(|p| ContainerPort {
                name: Some(p.name.clone()),
                container_port: i32::from(p.target_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();
        let env_from = app.secrets_in_environment.then(|| {
            vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: app.name.clone(),
                    optional: Some(true),
                }),
                ..Default::default()
            }]
        });

        Container {
            name: app.name.clone(),
            image: Some(app.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: (!ports.is_empty()).then_some(ports),
            env: Some(self.env(app)),
            env_from,
            liveness_probe: app.health_checks.liveness.as_ref().map(probe),
            readiness_probe: app.health_checks.readiness.as_ref().map(probe),
            resources: resources(&app.resources),
            ..Default::default()
        }
    }

    fn datadog_container(&self, app: &AppSpec) -> Option<Container> {
        if !app.datadog.enabled {
            return None;
        }
        let Some(image) = &self.config.datadog_image else {
            warn!(
                app = %app.name,
                "datadog is enabled but no datadog container image is configured; skipping sidecar"
            );
            return None;
        };
        let mut tags = vec![format!("app:{}", app.name)];
        tags.extend(app.datadog.tags.iter().map(|(k, v)| format!("{}:{}", k, v)));

        Some(Container {
            name: DATADOG_CONTAINER_NAME.to_string(),
            image: Some(image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(vec![
                EnvVar {
                    name: "DD_API_KEY".to_string(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: DATADOG_API_KEY_SECRET.to_string(),
                            key: "apikey".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                env_var("DD_TAGS", &tags.join(",")),
                env_var("NON_LOCAL_TRAFFIC", "false"),
                env_var("DD_LOGS_STDOUT", "yes"),
            ]),
            resources: resources(&Resources {
                limits: ResourceValues {
                    memory: Some("2Gi".to_string()),
                    cpu: Some("400m".to_string()),
                },
                requests: ResourceValues {
                    memory: Some("200Mi".to_string()),
                    cpu: Some("200m".to_string()),
                },
            }),
            ..Default::default()
        })
    }
}

impl Deriver for DeploymentDeriver {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Deployment
    }

    fn derive(&self, app: &AppSpec, identity: &IdentityMetadata) -> Derived {
        let mut pod_annotations = app.annotations.pod.clone();
        if let (true, Some(port)) = (app.prometheus.enabled, app.prometheus.port) {
            pod_annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
            pod_annotations.insert("prometheus.io/port".to_string(), port.to_string());
            pod_annotations.insert("prometheus.io/path".to_string(), app.prometheus.path.clone());
        }

        let mut containers = vec![self.app_container(app)];
        containers.extend(self.datadog_container(app));

        let template = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(identity.labels_with(&app.labels.pod)),
                annotations: (!pod_annotations.is_empty()).then_some(pod_annotations),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                automount_service_account_token: Some(app.admin_access),
                ..Default::default()
            }),
        };

        Derived::Object(ManagedObject::Deployment(Deployment {
            metadata: object_meta(
                ObjectKind::Deployment,
                app,
                identity.labels_with(&app.labels.deployment),
                &app.annotations.deployment,
            ),
            spec: Some(DeploymentSpec {
                replicas: Some(int(app.replicas.minimum)),
                revision_history_limit: Some(REVISION_HISTORY_LIMIT),
                selector: LabelSelector {
                    match_labels: Some(identity.selector.clone()),
                    ..Default::default()
                },
                template,
                ..Default::default()
            }),
            status: None,
        }))
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn field_ref(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

fn probe(spec: &Probe) -> K8sProbe {
    let mut probe = K8sProbe {
        initial_delay_seconds: Some(spec.initial_delay_seconds),
        period_seconds: Some(spec.period_seconds),
        success_threshold: Some(spec.success_threshold),
        failure_threshold: Some(spec.failure_threshold),
        timeout_seconds: Some(spec.timeout_seconds),
        ..Default::default()
    };
    match &spec.action {
        ProbeAction::Exec { command } => {
            probe.exec = Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    command.clone(),
                ]),
            });
        }
        ProbeAction::Http {
            path,
            port,
            headers,
        } => {
            let headers: Vec<HTTPHeader> = headers
                .iter()
                .map(|(name, value)| HTTPHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect();
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(i32::from(*port)),
                scheme: Some("HTTP".to_string()),
                http_headers: (!headers.is_empty()).then_some(headers),
                host: None,
            });
        }
        ProbeAction::Tcp { port } => {
            probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(*port)),
                host: None,
            });
        }
    }
    probe
}

fn quantities(values: &ResourceValues) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = [("cpu", &values.cpu), ("memory", &values.memory)]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), Quantity(v.clone()))))
        .collect();
    (!map.is_empty()).then_some(map)
}

fn resources(spec: &Resources) -> Option<ResourceRequirements> {
    let limits = quantities(&spec.limits);
    let requests = quantities(&spec.requests);
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::app;
    use super::*;
    use serde_json::json;

    fn derive_with(config: DeriverConfig, spec: &AppSpec) -> Deployment {
        let identity = IdentityMetadata::for_app(spec, "1.0");
        match DeploymentDeriver::new(Arc::new(config)).derive(spec, &identity) {
            Derived::Object(ManagedObject::Deployment(d)) => d,
            other => panic!("expected a Deployment, got {:?}", other),
        }
    }

    fn derive(spec: &AppSpec) -> Deployment {
        derive_with(
            DeriverConfig {
                environment: "dev".to_string(),
                infrastructure: "diy".to_string(),
                global_env: vec![
                    ("REGION".to_string(), "eu".to_string()),
                    ("IMAGE".to_string(), "override".to_string()),
                ],
                ..Default::default()
            },
            spec,
        )
    }

    fn main_container(deployment: &Deployment) -> &Container {
        &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    /// Story: a default v3 app gets image, version and identity wired in
    #[test]
    fn story_default_app_deployment() {
        let spec = app(json!({"version": 3}));
        let deployment = derive(&spec);
        let dspec = deployment.spec.as_ref().unwrap();

        assert_eq!(dspec.replicas, Some(2));
        assert_eq!(dspec.revision_history_limit, Some(5));
        assert_eq!(
            dspec.selector.match_labels.as_ref().unwrap(),
            &BTreeMap::from([("app".to_string(), "web".to_string())])
        );
        let pod_labels = dspec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(pod_labels["fiaas/version"], "1.2");
        assert_eq!(pod_labels["fiaas/deployment_id"], "d1");

        let container = main_container(&deployment);
        assert_eq!(container.name, "web");
        assert_eq!(container.image.as_deref(), Some("registry.io/team/web:1.2"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);

        assert_eq!(env_value(container, "VERSION"), Some("1.2"));
        assert_eq!(env_value(container, "IMAGE"), Some("registry.io/team/web:1.2"));
        assert_eq!(env_value(container, "ARTIFACT_NAME"), Some("web"));
        assert_eq!(env_value(container, "FIAAS_ENVIRONMENT"), Some("dev"));
        assert_eq!(env_value(container, "FIAAS_INFRASTRUCTURE"), Some("diy"));
        assert_eq!(env_value(container, "REGION"), Some("eu"));
        let images = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .filter(|e| e.name == "IMAGE")
            .count();
        assert_eq!(images, 1);

        let liveness = container.liveness_probe.as_ref().unwrap();
        let http = liveness.http_get.as_ref().unwrap();
        assert_eq!(http.path.as_deref(), Some("/_/health"));
        assert_eq!(http.port, IntOrString::Int(8080));
        assert_eq!(liveness.initial_delay_seconds, Some(10));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("512Mi".to_string())
        );
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("200m".to_string())
        );

        let annotations = dspec
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(annotations["prometheus.io/scrape"], "true");
        assert_eq!(annotations["prometheus.io/port"], "8080");
        assert_eq!(annotations["prometheus.io/path"], "/_/metrics");

        let pod = dspec.template.spec.as_ref().unwrap();
        assert_eq!(pod.automount_service_account_token, Some(false));
        assert!(container.env_from.is_none());
    }

    #[test]
    fn exec_probes_run_through_a_shell() {
        let spec = app(json!({
            "version": 3,
            "healthchecks": {"liveness": {"execute": {"command": "pgrep web"}}}
        }));
        let deployment = derive(&spec);
        let exec = main_container(&deployment)
            .liveness_probe
            .as_ref()
            .unwrap()
            .exec
            .as_ref()
            .unwrap();
        assert_eq!(
            exec.command.as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "pgrep web".to_string()]
        );
    }

    #[test]
    fn portless_apps_are_not_annotated_for_scraping() {
        let spec = app(json!({"version": 3, "ports": []}));
        let deployment = derive(&spec);
        let template = &deployment.spec.as_ref().unwrap().template;
        assert!(template.metadata.as_ref().unwrap().annotations.is_none());
        assert!(main_container(&deployment).ports.is_none());
    }

    #[test]
    fn nulled_resources_are_omitted() {
        let spec = app(json!({
            "version": 3,
            "resources": {
                "limits": {"memory": null, "cpu": null},
                "requests": {"memory": null, "cpu": null}
            }
        }));
        assert!(main_container(&derive(&spec)).resources.is_none());
    }

    #[test]
    fn secrets_and_admin_access() {
        let spec = app(json!({
            "version": 3,
            "secrets_in_environment": true,
            "admin_access": true
        }));
        let deployment = derive(&spec);
        let container = main_container(&deployment);
        let secret = container.env_from.as_ref().unwrap()[0].secret_ref.as_ref().unwrap();
        assert_eq!(secret.name, "web");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.automount_service_account_token, Some(true));
    }

    #[test]
    fn datadog_sidecar_needs_an_image() {
        let spec = app(json!({
            "version": 3,
            "metrics": {"datadog": {"enabled": true, "tags": {"team": "core"}}}
        }));
        let without = derive(&spec);
        assert_eq!(without.spec.unwrap().template.spec.unwrap().containers.len(), 1);

        let with = derive_with(
            DeriverConfig {
                datadog_image: Some("datadog/agent:7".to_string()),
                ..Default::default()
            },
            &spec,
        );
        let containers = with.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, DATADOG_CONTAINER_NAME);
        assert_eq!(env_value(&containers[1], "DD_TAGS"), Some("app:web,team:core"));
    }

    #[test]
    fn user_labels_and_annotations_land_on_their_kind() {
        let spec = app(json!({
            "version": 3,
            "labels": {"deployment": {"team": "core"}, "pod": {"tier": "web"}},
            "annotations": {"deployment": {"owner": "core"}}
        }));
        let deployment = derive(&spec);
        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["team"], "core");
        assert!(!labels.contains_key("tier"));
        assert_eq!(deployment.metadata.annotations.as_ref().unwrap()["owner"], "core");
        let pod_labels = deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(pod_labels["tier"], "web");
        assert_eq!(pod_labels["app"], "web");
    }
}
