//! Canonical, version-independent application spec
//!
//! Every port reference has been resolved to a number by the time an
//! [`AppSpec`] exists: ingress rules point at service ports, probes and the
//! prometheus endpoint at container ports.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::raw::RawSpecDocument;

/// Autoscaler CPU target used when none is given
pub const DEFAULT_CPU_THRESHOLD: u32 = 50;

/// Port protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP traffic; eligible for ingress routing
    Http,
    /// Raw TCP traffic
    Tcp,
}

impl Protocol {
    /// Lowercase name as written in config documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
        }
    }
}

/// One exposed port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    /// Port name, unique within the application
    pub name: String,
    /// Protocol served on this port
    pub protocol: Protocol,
    /// Port exposed by the service
    pub port: u16,
    /// Port the container listens on
    pub target_port: u16,
}

/// One ingress host/path rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRule {
    /// Explicit host; None means one host per configured ingress suffix
    pub host: Option<String>,
    /// Path prefix
    pub path: String,
    /// Service port the rule routes to
    pub port: u16,
}

/// Replica bounds; equal bounds mean a fixed replica count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replicas {
    /// Lower bound and initial replica count
    pub minimum: u32,
    /// Upper bound
    pub maximum: u32,
}

/// Horizontal autoscaling thresholds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutoscalerSpec {
    /// Minimum replica count
    pub min_replicas: u32,
    /// Maximum replica count
    pub max_replicas: u32,
    /// Target average CPU utilization
    pub cpu_threshold_percentage: u32,
}

/// CPU and memory quantities; None leaves the value unset
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceValues {
    /// Memory quantity (e.g. "512Mi")
    pub memory: Option<String>,
    /// CPU quantity (e.g. "400m")
    pub cpu: Option<String>,
}

/// Container resource limits and requests
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    /// Upper bounds
    pub limits: ResourceValues,
    /// Scheduling requests
    pub requests: ResourceValues,
}

/// What a probe checks
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeAction {
    /// Shell command run inside the container
    Exec {
        /// Command line passed to `/bin/sh -c`
        command: String,
    },
    /// HTTP GET against a container port
    Http {
        /// Request path
        path: String,
        /// Container port
        port: u16,
        /// Extra request headers
        headers: BTreeMap<String, String>,
    },
    /// TCP connect to a container port
    Tcp {
        /// Container port
        port: u16,
    },
}

/// Liveness or readiness probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    /// Check to perform
    pub action: ProbeAction,
    /// Seconds before the first check
    pub initial_delay_seconds: i32,
    /// Seconds between checks
    pub period_seconds: i32,
    /// Consecutive successes to count as healthy
    pub success_threshold: i32,
    /// Consecutive failures to count as unhealthy
    pub failure_threshold: i32,
    /// Seconds before a check times out
    pub timeout_seconds: i32,
}

/// Probes for the application container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthChecks {
    /// Restart the container when failing
    pub liveness: Option<Probe>,
    /// Remove the pod from service endpoints when failing
    pub readiness: Option<Probe>,
}

/// Prometheus scrape settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prometheus {
    /// Whether pods are annotated for scraping
    pub enabled: bool,
    /// Container port to scrape; None when disabled or the app has no ports
    pub port: Option<u16>,
    /// Metrics path
    pub path: String,
}

/// Datadog sidecar settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Datadog {
    /// Whether a datadog agent sidecar is attached
    pub enabled: bool,
    /// Extra tags passed to the agent
    pub tags: BTreeMap<String, String>,
}

/// User-supplied labels or annotations per derived kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerKind {
    /// Deployment metadata
    pub deployment: BTreeMap<String, String>,
    /// Autoscaler metadata
    pub horizontal_pod_autoscaler: BTreeMap<String, String>,
    /// Ingress metadata
    pub ingress: BTreeMap<String, String>,
    /// Service metadata
    pub service: BTreeMap<String, String>,
    /// Pod template metadata
    pub pod: BTreeMap<String, String>,
}

/// The canonical application spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppSpec {
    /// Application name; names every derived object
    pub name: String,
    /// Namespace the application lives in
    pub namespace: String,
    /// Full container image reference
    pub image: String,
    /// Application version, taken from the image tag
    pub version: String,
    /// Correlation id of the deploy that submitted this spec
    pub deployment_id: String,
    /// Replica bounds
    pub replicas: Replicas,
    /// Set iff the replica bounds differ
    pub autoscaler: Option<AutoscalerSpec>,
    /// Container resources
    pub resources: Resources,
    /// Exposed ports in declaration order
    pub ports: Vec<PortSpec>,
    /// Ingress rules in declaration order
    pub ingress: Vec<IngressRule>,
    /// Container probes
    pub health_checks: HealthChecks,
    /// Prometheus scraping
    pub prometheus: Prometheus,
    /// Datadog sidecar
    pub datadog: Datadog,
    /// User labels per kind
    pub labels: PerKind,
    /// User annotations per kind
    pub annotations: PerKind,
    /// Load the app-named secret into the environment
    pub secrets_in_environment: bool,
    /// Mount the service account token
    pub admin_access: bool,
}

/// Version string for an image reference: the digest, the tag, or "latest"
pub fn image_version(image: &str) -> String {
    if let Some((_, digest)) = image.rsplit_once('@') {
        return digest.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag.to_string(),
        _ => "latest".to_string(),
    }
}

impl AppSpec {
    /// Ports serving HTTP, in declaration order
    pub fn http_ports(&self) -> impl Iterator<Item = &PortSpec> {
        self.ports.iter().filter(|p| p.protocol == Protocol::Http)
    }

    /// Port with the given service port number
    pub fn port_by_service_port(&self, port: u16) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.port == port)
    }

    /// Render this spec as a current-version document.
    ///
    /// Every defaulted value is written out explicitly, so normalizing the
    /// result yields this spec again.
    pub fn to_raw_document(&self) -> RawSpecDocument {
        let ingress: Vec<Value> = self
            .ingress
            .iter()
            .map(|rule| {
                let mut item = Map::new();
                if let Some(host) = &rule.host {
                    item.insert("host".to_string(), json!(host));
                }
                item.insert(
                    "paths".to_string(),
                    json!([{ "path": rule.path, "port": rule.port }]),
                );
                Value::Object(item)
            })
            .collect();

        let mut healthchecks = Map::new();
        if let Some(probe) = &self.health_checks.liveness {
            healthchecks.insert("liveness".to_string(), probe_document(probe));
        }
        if let Some(probe) = &self.health_checks.readiness {
            healthchecks.insert("readiness".to_string(), probe_document(probe));
        }

        let mut prometheus = Map::new();
        prometheus.insert("enabled".to_string(), json!(self.prometheus.enabled));
        if let Some(port) = self.prometheus.port {
            prometheus.insert("port".to_string(), json!(port));
        }
        prometheus.insert("path".to_string(), json!(self.prometheus.path));

        let cpu_threshold = self
            .autoscaler
            .map(|a| a.cpu_threshold_percentage)
            .unwrap_or(DEFAULT_CPU_THRESHOLD);

        let config = json!({
            "version": crate::CANONICAL_VERSION,
            "replicas": {
                "minimum": self.replicas.minimum,
                "maximum": self.replicas.maximum,
                "cpu_threshold_percentage": cpu_threshold,
            },
            "ingress": ingress,
            "healthchecks": healthchecks,
            "resources": {
                "limits": resource_document(&self.resources.limits),
                "requests": resource_document(&self.resources.requests),
            },
            "metrics": {
                "prometheus": prometheus,
                "datadog": {
                    "enabled": self.datadog.enabled,
                    "tags": self.datadog.tags,
                },
            },
            "ports": self.ports.iter().map(|p| json!({
                "protocol": p.protocol.as_str(),
                "name": p.name,
                "port": p.port,
                "target_port": p.target_port,
            })).collect::<Vec<_>>(),
            "annotations": per_kind_document(&self.annotations),
            "labels": per_kind_document(&self.labels),
            "secrets_in_environment": self.secrets_in_environment,
            "admin_access": self.admin_access,
        });

        RawSpecDocument {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            deployment_id: self.deployment_id.clone(),
            config,
        }
    }
}

fn probe_document(probe: &Probe) -> Value {
    let mut doc = Map::new();
    match &probe.action {
        ProbeAction::Exec { command } => {
            doc.insert("execute".to_string(), json!({ "command": command }));
        }
        ProbeAction::Http {
            path,
            port,
            headers,
        } => {
            doc.insert(
                "http".to_string(),
                json!({ "path": path, "port": port, "http_headers": headers }),
            );
        }
        ProbeAction::Tcp { port } => {
            doc.insert("tcp".to_string(), json!({ "port": port }));
        }
    }
    doc.insert(
        "initial_delay_seconds".to_string(),
        json!(probe.initial_delay_seconds),
    );
    doc.insert("period_seconds".to_string(), json!(probe.period_seconds));
    doc.insert(
        "success_threshold".to_string(),
        json!(probe.success_threshold),
    );
    doc.insert(
        "failure_threshold".to_string(),
        json!(probe.failure_threshold),
    );
    doc.insert("timeout_seconds".to_string(), json!(probe.timeout_seconds));
    Value::Object(doc)
}

fn resource_document(values: &ResourceValues) -> Value {
    json!({ "memory": values.memory, "cpu": values.cpu })
}

fn per_kind_document(per_kind: &PerKind) -> Value {
    json!({
        "deployment": per_kind.deployment,
        "horizontal_pod_autoscaler": per_kind.horizontal_pod_autoscaler,
        "ingress": per_kind.ingress,
        "service": per_kind.service,
        "pod": per_kind.pod,
    })
}
