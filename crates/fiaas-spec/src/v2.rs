//! Version 2 config schema and its upgrade to version 3
//!
//! The upgrade checks the v2 shape, applies v2 defaults and rewrites the
//! document into v3 terms. Port and probe values are passed through
//! untouched; the v3 parser resolves and validates them.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use fiaas_common::Result;

use crate::raw::parse_config;

const DEFAULT_PROMETHEUS_PATH: &str = "/internal-backstage/prometheus";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default = "default_replicas")]
    replicas: u32,
    #[serde(default)]
    autoscaler: AutoscalerDoc,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    prometheus: PrometheusDoc,
    #[serde(default)]
    datadog: bool,
    #[serde(default)]
    resources: ResourcesDoc,
    #[serde(default)]
    ports: Option<Vec<PortDoc>>,
    #[serde(default)]
    healthchecks: HealthChecksDoc,
    #[serde(default)]
    config: DeprecatedConfigDoc,
    #[serde(default)]
    has_secrets: bool,
    #[serde(default)]
    admin_access: bool,
}

fn default_replicas() -> u32 {
    2
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct AutoscalerDoc {
    enabled: bool,
    min_replicas: u32,
    cpu_threshold_percentage: u32,
}

impl Default for AutoscalerDoc {
    fn default() -> Self {
        Self {
            enabled: false,
            min_replicas: 2,
            cpu_threshold_percentage: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct PrometheusDoc {
    enabled: bool,
    port: Option<Value>,
    path: String,
}

impl Default for PrometheusDoc {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            path: DEFAULT_PROMETHEUS_PATH.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ResourcesDoc {
    limits: ResourceValuesDoc,
    requests: ResourceValuesDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ResourceValuesDoc {
    memory: Option<Value>,
    cpu: Option<Value>,
}

impl ResourceValuesDoc {
    // v2 has no resource defaults; absent values become explicit nulls so
    // that v3 defaults are not injected
    fn to_v3(&self) -> Value {
        json!({
            "memory": self.memory.clone().unwrap_or(Value::Null),
            "cpu": self.cpu.clone().unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortDoc {
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default = "default_port_name")]
    name: String,
    #[serde(default = "default_service_port")]
    port: Value,
    #[serde(default = "default_target_port")]
    target_port: Value,
    #[serde(default = "default_path")]
    path: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_port_name() -> String {
    "http".to_string()
}

fn default_service_port() -> Value {
    json!(80)
}

fn default_target_port() -> Value {
    json!(8080)
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct HealthChecksDoc {
    liveness: Option<Value>,
    readiness: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct DeprecatedConfigDoc {
    volume: bool,
    envs: Vec<String>,
}

/// Rewrite a version 2 config (without its `version` key) into version 3 shape
pub(crate) fn upgrade_to_v3(app: &str, config: Value) -> Result<Value> {
    let doc: Config = parse_config(app, config)?;
    warn_deprecated(app, &doc);

    let ports = doc.ports.unwrap_or_else(|| {
        vec![PortDoc {
            protocol: default_protocol(),
            name: default_port_name(),
            port: default_service_port(),
            target_port: default_target_port(),
            path: default_path(),
        }]
    });
    let http_ports: Vec<&PortDoc> = ports.iter().filter(|p| p.protocol == "http").collect();

    let ingress = if http_ports.is_empty() {
        json!([])
    } else {
        let mut item = Map::new();
        if let Some(host) = doc.host.as_ref().filter(|h| !h.is_empty()) {
            item.insert("host".to_string(), json!(host));
        }
        item.insert(
            "paths".to_string(),
            Value::Array(
                http_ports
                    .iter()
                    .map(|p| json!({ "path": p.path, "port": p.name }))
                    .collect(),
            ),
        );
        json!([item])
    };

    let liveness = doc.healthchecks.liveness.or_else(|| {
        if let Some(http) = http_ports.first() {
            Some(json!({ "http": { "path": "/", "port": http.name } }))
        } else {
            ports
                .first()
                .map(|p| json!({ "tcp": { "port": p.name } }))
        }
    });
    let readiness = doc.healthchecks.readiness.or_else(|| liveness.clone());
    let mut healthchecks = Map::new();
    if let Some(probe) = liveness {
        healthchecks.insert("liveness".to_string(), probe);
    }
    if let Some(probe) = readiness {
        healthchecks.insert("readiness".to_string(), probe);
    }

    let (minimum, maximum) = if doc.autoscaler.enabled {
        (doc.autoscaler.min_replicas, doc.replicas)
    } else {
        (doc.replicas, doc.replicas)
    };

    Ok(json!({
        "replicas": {
            "minimum": minimum,
            "maximum": maximum,
            "cpu_threshold_percentage": doc.autoscaler.cpu_threshold_percentage,
        },
        "ingress": ingress,
        "healthchecks": healthchecks,
        "resources": {
            "limits": doc.resources.limits.to_v3(),
            "requests": doc.resources.requests.to_v3(),
        },
        "metrics": {
            "prometheus": {
                "enabled": doc.prometheus.enabled,
                "port": doc.prometheus.port,
                "path": doc.prometheus.path,
            },
            "datadog": { "enabled": doc.datadog },
        },
        "ports": ports.iter().map(|p| json!({
            "protocol": p.protocol,
            "name": p.name,
            "port": p.port,
            "target_port": p.target_port,
        })).collect::<Vec<_>>(),
        "secrets_in_environment": doc.has_secrets,
        "admin_access": doc.admin_access,
    }))
}

fn warn_deprecated(app: &str, doc: &Config) {
    if let Some(namespace) = &doc.namespace {
        warn!(
            app = %app,
            namespace = %namespace,
            "config field namespace is deprecated and ignored; the application resource namespace is used"
        );
    }
    if doc.config.volume {
        warn!(app = %app, "config field config.volume is deprecated and ignored");
    }
    if !doc.config.envs.is_empty() {
        warn!(
            app = %app,
            envs = ?doc.config.envs,
            "config field config.envs is deprecated and ignored"
        );
    }
}
