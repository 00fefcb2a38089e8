//! Desired cluster objects and their merge into live state
//!
//! A desired object is built fresh for every reconciliation. At apply time it
//! is merged into the live object so that server-managed fields (resource
//! versions, generated IPs, node ports, status) survive the update.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::ObjectMeta;
use serde_json::Value;

use fiaas_common::kube_utils::deterministic_hash;
use fiaas_common::{Error, Result};

/// Annotation recording the hash of the desired object last written
pub const DESIRED_HASH_ANNOTATION: &str = "fiaas/desired-hash";

/// The kinds of object derived for every application, in apply order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// apps/v1 Deployment
    Deployment,
    /// v1 Service
    Service,
    /// networking.k8s.io/v1 Ingress
    Ingress,
    /// autoscaling/v1 HorizontalPodAutoscaler
    Autoscaler,
}

impl ObjectKind {
    /// Every kind in apply order
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Deployment,
        ObjectKind::Service,
        ObjectKind::Ingress,
        ObjectKind::Autoscaler,
    ];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
            Self::Autoscaler => "HorizontalPodAutoscaler",
        }
    }

    /// Name of this kind's object for an application; a function of the
    /// application name alone
    pub fn object_name(&self, app: &str) -> String {
        app.to_string()
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed cluster object managed for an application
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// Workload
    Deployment(Deployment),
    /// Stable network endpoint
    Service(Service),
    /// HTTP routing
    Ingress(Ingress),
    /// Horizontal autoscaler
    Autoscaler(HorizontalPodAutoscaler),
}

impl ManagedObject {
    /// Kind of this object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Deployment(_) => ObjectKind::Deployment,
            Self::Service(_) => ObjectKind::Service,
            Self::Ingress(_) => ObjectKind::Ingress,
            Self::Autoscaler(_) => ObjectKind::Autoscaler,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Ingress(o) => &o.metadata,
            Self::Autoscaler(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::Ingress(o) => &mut o.metadata,
            Self::Autoscaler(o) => &mut o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Server-assigned resource version, if any
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// JSON form of the object
    pub fn to_json(&self) -> Result<Value> {
        let value = match self {
            Self::Deployment(o) => serde_json::to_value(o),
            Self::Service(o) => serde_json::to_value(o),
            Self::Ingress(o) => serde_json::to_value(o),
            Self::Autoscaler(o) => serde_json::to_value(o),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))
    }

    /// Stamp the hash of this desired object as an annotation
    pub fn with_desired_hash(mut self) -> Result<Self> {
        if let Some(annotations) = self.metadata_mut().annotations.as_mut() {
            annotations.remove(DESIRED_HASH_ANNOTATION);
        }
        let hash = deterministic_hash(&self.to_json()?.to_string());
        self.metadata_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DESIRED_HASH_ANNOTATION.to_string(), hash);
        Ok(self)
    }

    /// Desired hash recorded on this object
    pub fn desired_hash(&self) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(DESIRED_HASH_ANNOTATION))
            .map(String::as_str)
    }

    /// Merge this desired object into `live`, keeping server-managed state.
    ///
    /// Labels come from the desired object; annotations are the union with
    /// desired values winning. With `preserve_replicas` the live replica count
    /// of a Deployment is kept, since an autoscaler owns it.
    pub fn merge_live(&self, live: &ManagedObject, preserve_replicas: bool) -> Result<ManagedObject> {
        let mut merged = self.clone();

        let live_meta = live.metadata();
        let meta = merged.metadata_mut();
        meta.resource_version = live_meta.resource_version.clone();
        meta.uid = live_meta.uid.clone();
        meta.creation_timestamp = live_meta.creation_timestamp.clone();
        meta.generation = live_meta.generation;
        meta.managed_fields = live_meta.managed_fields.clone();
        if meta.owner_references.is_none() {
            meta.owner_references = live_meta.owner_references.clone();
        }
        if meta.finalizers.is_none() {
            meta.finalizers = live_meta.finalizers.clone();
        }
        let mut annotations = live_meta.annotations.clone().unwrap_or_default();
        annotations.extend(meta.annotations.take().unwrap_or_default());
        meta.annotations = (!annotations.is_empty()).then_some(annotations);

        match (&mut merged, live) {
            (Self::Deployment(desired), Self::Deployment(live)) => {
                desired.status = live.status.clone();
                if preserve_replicas {
                    if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                        if live_spec.replicas.is_some() {
                            spec.replicas = live_spec.replicas;
                        }
                    }
                }
            }
            (Self::Service(desired), Self::Service(live)) => {
                desired.status = live.status.clone();
                if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                    spec.cluster_ip = live_spec.cluster_ip.clone();
                    spec.cluster_ips = live_spec.cluster_ips.clone();
                    if spec.ip_families.is_none() {
                        spec.ip_families = live_spec.ip_families.clone();
                    }
                    if spec.ip_family_policy.is_none() {
                        spec.ip_family_policy = live_spec.ip_family_policy.clone();
                    }
                    let allocates_node_ports = matches!(
                        spec.type_.as_deref(),
                        Some("NodePort") | Some("LoadBalancer")
                    );
                    if allocates_node_ports {
                        let live_ports = live_spec.ports.as_deref().unwrap_or_default();
                        for port in spec.ports.iter_mut().flatten() {
                            if port.node_port.is_none() {
                                port.node_port = live_ports
                                    .iter()
                                    .find(|p| p.port == port.port)
                                    .and_then(|p| p.node_port);
                            }
                        }
                    }
                }
            }
            (Self::Ingress(desired), Self::Ingress(live)) => {
                desired.status = live.status.clone();
            }
            (Self::Autoscaler(desired), Self::Autoscaler(live)) => {
                desired.status = live.status.clone();
            }
            _ => {
                return Err(Error::internal_with_context(
                    "merge",
                    format!(
                        "cannot merge live {} into desired {}",
                        live.kind(),
                        self.kind()
                    ),
                ))
            }
        }
        Ok(merged)
    }

    /// Whether `live` already matches this merged object: same desired hash
    /// and every field set here is set identically on `live`
    pub fn is_satisfied_by(&self, live: &ManagedObject) -> Result<bool> {
        if self.desired_hash().is_none() || self.desired_hash() != live.desired_hash() {
            return Ok(false);
        }
        Ok(is_subset(&self.to_json()?, &live.to_json()?))
    }
}

/// Structural containment: objects may have extra keys on the right, arrays
/// must match element-wise, scalars must be equal. Resource quantities under
/// `limits`/`requests` compare by value, since the API server returns them in
/// canonical form ("1000m" comes back as "1").
fn is_subset(desired: &Value, live: &Value) -> bool {
    subset_at(desired, live, false)
}

fn subset_at(desired: &Value, live: &Value, quantities: bool) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, v)| {
            let quantities = k == "limits" || k == "requests";
            v.is_null() || l.get(k).is_some_and(|lv| subset_at(v, lv, quantities))
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| subset_at(dv, lv, false))
        }
        (Value::String(d), Value::String(l)) if quantities && d != l => {
            match (parse_quantity(d), parse_quantity(l)) {
                (Some(d), Some(l)) => (d - l).abs() <= f64::EPSILON * d.abs().max(l.abs()),
                _ => false,
            }
        }
        (d, l) => d == l,
    }
}

/// Numeric value of a Kubernetes quantity such as `500m`, `1.5`, `2Gi`, `1e3`
fn parse_quantity(quantity: &str) -> Option<f64> {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
    ];
    const DECIMAL: [(char, f64); 7] = [
        ('m', 1e-3),
        ('k', 1e3),
        ('M', 1e6),
        ('G', 1e9),
        ('T', 1e12),
        ('P', 1e15),
        ('E', 1e18),
    ];
    let quantity = quantity.trim();
    let (number, scale) = BINARY
        .iter()
        .find_map(|(suffix, scale)| quantity.strip_suffix(*suffix).map(|n| (n, *scale)))
        .or_else(|| {
            DECIMAL
                .iter()
                .find_map(|(suffix, scale)| quantity.strip_suffix(*suffix).map(|n| (n, *scale)))
        })
        .unwrap_or((quantity, 1.0));
    let numeric_start = |c: char| c.is_ascii_digit() || matches!(c, '.' | '-' | '+');
    if !number.starts_with(numeric_start) {
        return None;
    }
    number.parse::<f64>().ok().map(|n| n * scale)
}
