//! Versioned application spec parsing, defaulting and migration
//!
//! A [`RawSpecDocument`] carries the application identity and an unparsed
//! config of some schema version. [`normalize`] validates it, applies the
//! defaults of its version, upgrades it to the current version and produces
//! the canonical [`AppSpec`].

pub mod app_spec;
pub mod normalizer;
mod raw;
mod v2;
mod v3;

pub use app_spec::{
    image_version, AppSpec, AutoscalerSpec, Datadog, HealthChecks, IngressRule, PerKind,
    PortSpec, Probe, ProbeAction, Prometheus, Protocol, Replicas, ResourceValues, Resources,
};
pub use normalizer::{is_valid_app_name, normalize, CANONICAL_VERSION, UPGRADES};
pub use raw::RawSpecDocument;
