//! Version 3 config schema, the canonical generation
//!
//! Parsing applies the declared defaults, then resolves every port reference
//! against the declared ports and checks value ranges.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use fiaas_common::{Error, Result};

use crate::app_spec::{
    image_version, AppSpec, AutoscalerSpec, Datadog, HealthChecks, IngressRule, PerKind,
    PortSpec, Probe, ProbeAction, Prometheus, Protocol, Replicas, ResourceValues, Resources,
};
use crate::raw::{parse_config, port_number, quantity, PortRef, RawSpecDocument};

const DEFAULT_LIVENESS_PATH: &str = "/_/health";
const DEFAULT_READINESS_PATH: &str = "/_/ready";
const DEFAULT_METRICS_PATH: &str = "/_/metrics";
const MAX_PORT_NAME_LENGTH: usize = 15;

// ============================================================================
// Document shape
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    replicas: ReplicasDoc,
    #[serde(default)]
    ingress: Option<Vec<IngressItem>>,
    #[serde(default)]
    healthchecks: HealthChecksDoc,
    #[serde(default)]
    resources: ResourcesDoc,
    #[serde(default)]
    metrics: MetricsDoc,
    #[serde(default)]
    ports: Option<Vec<PortDoc>>,
    #[serde(default)]
    annotations: PerKindDoc,
    #[serde(default)]
    labels: PerKindDoc,
    #[serde(default)]
    secrets_in_environment: bool,
    #[serde(default)]
    admin_access: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ReplicasDoc {
    minimum: u32,
    maximum: u32,
    cpu_threshold_percentage: u32,
}

impl Default for ReplicasDoc {
    fn default() -> Self {
        Self {
            minimum: 2,
            maximum: 5,
            cpu_threshold_percentage: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngressItem {
    #[serde(default)]
    host: Option<String>,
    #[serde(default = "default_ingress_paths")]
    paths: Vec<IngressPathDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngressPathDoc {
    #[serde(default = "default_path")]
    path: String,
    #[serde(default = "default_port_name")]
    port: PortRef,
}

fn default_ingress_paths() -> Vec<IngressPathDoc> {
    vec![IngressPathDoc {
        path: default_path(),
        port: default_port_name(),
    }]
}

fn default_path() -> String {
    "/".to_string()
}

fn default_port_name() -> PortRef {
    PortRef::name("http")
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthChecksDoc {
    #[serde(default)]
    liveness: Option<ProbeDoc>,
    #[serde(default)]
    readiness: Option<ProbeDoc>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProbeDoc {
    #[serde(default)]
    execute: Option<ExecDoc>,
    #[serde(default)]
    http: Option<HttpDoc>,
    #[serde(default)]
    tcp: Option<TcpDoc>,
    #[serde(default = "default_initial_delay")]
    initial_delay_seconds: i32,
    #[serde(default = "default_period")]
    period_seconds: i32,
    #[serde(default = "one")]
    success_threshold: i32,
    #[serde(default = "default_failure_threshold")]
    failure_threshold: i32,
    #[serde(default = "one")]
    timeout_seconds: i32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecDoc {
    command: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpDoc {
    #[serde(default = "default_path")]
    path: String,
    #[serde(default = "default_port_name")]
    port: PortRef,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TcpDoc {
    port: PortRef,
}

fn default_initial_delay() -> i32 {
    10
}

fn default_period() -> i32 {
    10
}

fn default_failure_threshold() -> i32 {
    3
}

fn one() -> i32 {
    1
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourcesDoc {
    #[serde(default)]
    limits: ResourceValuesDoc,
    #[serde(default)]
    requests: ResourceValuesDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceValuesDoc {
    #[serde(default, deserialize_with = "quantity")]
    memory: Option<Option<String>>,
    #[serde(default, deserialize_with = "quantity")]
    cpu: Option<Option<String>>,
}

impl ResourceValuesDoc {
    fn resolve(self, memory: &str, cpu: &str) -> ResourceValues {
        ResourceValues {
            memory: self.memory.unwrap_or_else(|| Some(memory.to_string())),
            cpu: self.cpu.unwrap_or_else(|| Some(cpu.to_string())),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricsDoc {
    #[serde(default)]
    prometheus: PrometheusDoc,
    #[serde(default)]
    datadog: DatadogDoc,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct PrometheusDoc {
    enabled: bool,
    port: Option<PortRef>,
    path: String,
}

impl Default for PrometheusDoc {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct DatadogDoc {
    enabled: bool,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortDoc {
    #[serde(default = "default_protocol")]
    protocol: ProtocolDoc,
    #[serde(default = "default_port_name_string")]
    name: String,
    #[serde(default = "default_service_port", deserialize_with = "port_number")]
    port: u32,
    #[serde(default = "default_target_port", deserialize_with = "port_number")]
    target_port: u32,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ProtocolDoc {
    Http,
    Tcp,
}

fn default_protocol() -> ProtocolDoc {
    ProtocolDoc::Http
}

fn default_port_name_string() -> String {
    "http".to_string()
}

fn default_service_port() -> u32 {
    80
}

fn default_target_port() -> u32 {
    8080
}

fn default_ports() -> Vec<PortDoc> {
    vec![PortDoc {
        protocol: default_protocol(),
        name: default_port_name_string(),
        port: default_service_port(),
        target_port: default_target_port(),
    }]
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct PerKindDoc {
    deployment: BTreeMap<String, String>,
    horizontal_pod_autoscaler: BTreeMap<String, String>,
    ingress: BTreeMap<String, String>,
    service: BTreeMap<String, String>,
    pod: BTreeMap<String, String>,
}

impl From<PerKindDoc> for PerKind {
    fn from(doc: PerKindDoc) -> Self {
        Self {
            deployment: doc.deployment,
            horizontal_pod_autoscaler: doc.horizontal_pod_autoscaler,
            ingress: doc.ingress,
            service: doc.service,
            pod: doc.pod,
        }
    }
}

// ============================================================================
// Conversion into AppSpec
// ============================================================================

/// Parse a version 3 config (without its `version` key) into an [`AppSpec`]
pub(crate) fn parse(raw: &RawSpecDocument, config: serde_json::Value) -> Result<AppSpec> {
    let app = raw.name.as_str();
    let doc: Config = parse_config(app, config)?;

    let ports = resolve_ports(app, doc.ports.unwrap_or_else(default_ports))?;
    let ingress = resolve_ingress(app, doc.ingress, &ports)?;
    let replicas = Replicas {
        minimum: doc.replicas.minimum,
        maximum: doc.replicas.maximum,
    };
    let autoscaler = resolve_autoscaler(app, &doc.replicas)?;

    let health_checks = HealthChecks {
        liveness: match doc.healthchecks.liveness {
            Some(probe) => Some(resolve_probe(app, "healthchecks.liveness", probe, &ports)?),
            None => default_probe(&ports, DEFAULT_LIVENESS_PATH),
        },
        readiness: match doc.healthchecks.readiness {
            Some(probe) => Some(resolve_probe(app, "healthchecks.readiness", probe, &ports)?),
            None => default_probe(&ports, DEFAULT_READINESS_PATH),
        },
    };

    let prometheus_doc = doc.metrics.prometheus;
    let prometheus = Prometheus {
        enabled: prometheus_doc.enabled,
        port: match (prometheus_doc.enabled, &prometheus_doc.port) {
            (false, _) => None,
            (true, Some(port)) => Some(resolve_container_port(
                app,
                "metrics.prometheus.port",
                port,
                &ports,
            )?),
            (true, None) => default_metrics_port(&ports),
        },
        path: prometheus_doc.path,
    };

    let resources = Resources {
        limits: doc.resources.limits.resolve("512Mi", "400m"),
        requests: doc.resources.requests.resolve("256Mi", "200m"),
    };

    Ok(AppSpec {
        name: raw.name.clone(),
        namespace: raw.namespace.clone(),
        image: raw.image.clone(),
        version: image_version(&raw.image),
        deployment_id: raw.deployment_id.clone(),
        replicas,
        autoscaler,
        resources,
        ports,
        ingress,
        health_checks,
        prometheus,
        datadog: Datadog {
            enabled: doc.metrics.datadog.enabled,
            tags: doc.metrics.datadog.tags,
        },
        labels: doc.labels.into(),
        annotations: doc.annotations.into(),
        secrets_in_environment: doc.secrets_in_environment,
        admin_access: doc.admin_access,
    })
}

fn checked_port(app: &str, field: &str, value: u32) -> Result<u16> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::validation_for_field(
            app,
            field,
            format!("port {} is outside 1..=65535", value),
        )),
    }
}

fn is_port_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_PORT_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && name.chars().any(|c| c.is_ascii_lowercase())
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn resolve_ports(app: &str, docs: Vec<PortDoc>) -> Result<Vec<PortSpec>> {
    let mut names = HashSet::new();
    let mut service_ports = HashSet::new();
    let mut ports = Vec::with_capacity(docs.len());
    for (i, doc) in docs.into_iter().enumerate() {
        let field = |f: &str| format!("ports[{}].{}", i, f);
        if !is_port_name(&doc.name) {
            return Err(Error::validation_for_field(
                app,
                field("name"),
                format!("{:?} is not a valid port name", doc.name),
            ));
        }
        if !names.insert(doc.name.clone()) {
            return Err(Error::validation_for_field(
                app,
                field("name"),
                format!("duplicate port name {:?}", doc.name),
            ));
        }
        let port = checked_port(app, &field("port"), doc.port)?;
        if !service_ports.insert(port) {
            return Err(Error::validation_for_field(
                app,
                field("port"),
                format!("duplicate service port {}", port),
            ));
        }
        ports.push(PortSpec {
            name: doc.name,
            protocol: match doc.protocol {
                ProtocolDoc::Http => Protocol::Http,
                ProtocolDoc::Tcp => Protocol::Tcp,
            },
            port,
            target_port: checked_port(app, &field("target_port"), doc.target_port)?,
        });
    }
    Ok(ports)
}

fn resolve_ingress(
    app: &str,
    items: Option<Vec<IngressItem>>,
    ports: &[PortSpec],
) -> Result<Vec<IngressRule>> {
    let Some(items) = items else {
        return Ok(ports
            .iter()
            .find(|p| p.protocol == Protocol::Http)
            .map(|p| IngressRule {
                host: None,
                path: default_path(),
                port: p.port,
            })
            .into_iter()
            .collect());
    };

    let mut rules = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        let host = item.host.filter(|h| !h.is_empty());
        for (j, path) in item.paths.into_iter().enumerate() {
            let field = format!("ingress[{}].paths[{}]", i, j);
            if !path.path.starts_with('/') {
                return Err(Error::validation_for_field(
                    app,
                    format!("{}.path", field),
                    format!("path {:?} must start with /", path.path),
                ));
            }
            let target = ports
                .iter()
                .filter(|p| p.protocol == Protocol::Http)
                .find(|p| match &path.port {
                    PortRef::Name(name) => &p.name == name,
                    PortRef::Number(n) => u32::from(p.port) == *n,
                })
                .ok_or_else(|| {
                    Error::validation_for_field(
                        app,
                        format!("{}.port", field),
                        format!("{} does not name an http port", path.port),
                    )
                })?;
            rules.push(IngressRule {
                host: host.clone(),
                path: path.path,
                port: target.port,
            });
        }
    }
    Ok(rules)
}

fn resolve_autoscaler(app: &str, replicas: &ReplicasDoc) -> Result<Option<AutoscalerSpec>> {
    if replicas.minimum > replicas.maximum {
        return Err(Error::validation_for_field(
            app,
            "replicas.minimum",
            format!(
                "minimum {} exceeds maximum {}",
                replicas.minimum, replicas.maximum
            ),
        ));
    }
    if !(1..=100).contains(&replicas.cpu_threshold_percentage) {
        return Err(Error::validation_for_field(
            app,
            "replicas.cpu_threshold_percentage",
            format!(
                "{} is outside 1..=100",
                replicas.cpu_threshold_percentage
            ),
        ));
    }
    if replicas.minimum == replicas.maximum {
        return Ok(None);
    }
    if replicas.minimum == 0 {
        return Err(Error::validation_for_field(
            app,
            "replicas.minimum",
            "autoscaled applications need at least one replica",
        ));
    }
    Ok(Some(AutoscalerSpec {
        min_replicas: replicas.minimum,
        max_replicas: replicas.maximum,
        cpu_threshold_percentage: replicas.cpu_threshold_percentage,
    }))
}

/// Probe ports by name resolve to the named port's container port; numbers
/// are container ports already.
fn resolve_container_port(app: &str, field: &str, port: &PortRef, ports: &[PortSpec]) -> Result<u16> {
    match port {
        PortRef::Number(n) => checked_port(app, field, *n),
        PortRef::Name(name) => ports
            .iter()
            .find(|p| &p.name == name)
            .map(|p| p.target_port)
            .ok_or_else(|| {
                Error::validation_for_field(app, field, format!("no port named {:?}", name))
            }),
    }
}

fn resolve_probe(
    app: &str,
    field: &str,
    doc: ProbeDoc,
    ports: &[PortSpec],
) -> Result<Probe> {
    let action = match (doc.execute, doc.http, doc.tcp) {
        (Some(exec), None, None) => ProbeAction::Exec {
            command: exec.command,
        },
        (None, Some(http), None) => ProbeAction::Http {
            port: resolve_container_port(app, &format!("{}.http.port", field), &http.port, ports)?,
            path: http.path,
            headers: http.http_headers,
        },
        (None, None, Some(tcp)) => ProbeAction::Tcp {
            port: resolve_container_port(app, &format!("{}.tcp.port", field), &tcp.port, ports)?,
        },
        _ => {
            return Err(Error::validation_for_field(
                app,
                field,
                "exactly one of execute, http or tcp is required",
            ))
        }
    };
    Ok(Probe {
        action,
        initial_delay_seconds: doc.initial_delay_seconds,
        period_seconds: doc.period_seconds,
        success_threshold: doc.success_threshold,
        failure_threshold: doc.failure_threshold,
        timeout_seconds: doc.timeout_seconds,
    })
}

/// HTTP probe on the first http port, else TCP on the first port, else none
/// Scrape port when none is given: the port named "http", else the first
/// http port, else the first port. No ports means nothing to scrape.
fn default_metrics_port(ports: &[PortSpec]) -> Option<u16> {
    ports
        .iter()
        .find(|p| p.name == "http")
        .or_else(|| ports.iter().find(|p| p.protocol == Protocol::Http))
        .or_else(|| ports.first())
        .map(|p| p.target_port)
}

fn default_probe(ports: &[PortSpec], path: &str) -> Option<Probe> {
    let action = match ports.iter().find(|p| p.protocol == Protocol::Http) {
        Some(http) => ProbeAction::Http {
            path: path.to_string(),
            port: http.target_port,
            headers: BTreeMap::new(),
        },
        None => ProbeAction::Tcp {
            port: ports.first()?.target_port,
        },
    };
    Some(Probe {
        action,
        initial_delay_seconds: default_initial_delay(),
        period_seconds: default_period(),
        success_threshold: one(),
        failure_threshold: default_failure_threshold(),
        timeout_seconds: one(),
    })
}
