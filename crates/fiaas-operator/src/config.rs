//! Command line and environment configuration
//!
//! Every flag can also be set through the environment variable named next to
//! it. The parsed [`Cli`] is converted into the plain config structs of the
//! library crates; nothing below this module reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use fiaas_common::crd::SpecSource;
use fiaas_common::retry::RetryConfig;
use fiaas_deployer::{DeployerConfig, DeriverConfig, ReporterConfig, ServiceType};

use crate::dispatcher::DispatcherConfig;

/// fiaas deploy daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "fiaas-deploy-daemon", version, about = "Deploys fiaas applications to Kubernetes")]
pub struct Cli {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Path to a kubeconfig file; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch for application resources
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Environment name exposed to applications and used in task names
    #[arg(long, env = "FIAAS_ENVIRONMENT", default_value = "dev")]
    pub environment: String,

    /// Infrastructure name exposed to applications and used in task names
    #[arg(long, env = "FIAAS_INFRASTRUCTURE", default_value = "diy")]
    pub infrastructure: String,

    /// Type of the Services created for applications
    #[arg(long, env = "FIAAS_SERVICE_TYPE", value_enum, default_value_t = ServiceTypeArg::ClusterIp)]
    pub service_type: ServiceTypeArg,

    /// Suffix appended to the app name for ingress rules without a host
    #[arg(long = "ingress-suffix", env = "FIAAS_INGRESS_SUFFIXES", value_delimiter = ',')]
    pub ingress_suffixes: Vec<String>,

    /// ingressClassName set on every Ingress
    #[arg(long, env = "FIAAS_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    /// Environment variable (KEY=VALUE) added to every application container
    #[arg(long = "global-env", value_parser = parse_key_value)]
    pub global_env: Vec<(String, String)>,

    /// Image of the datadog agent sidecar
    #[arg(long, env = "FIAAS_DATADOG_CONTAINER_IMAGE")]
    pub datadog_container_image: Option<String>,

    /// Watch fiaas.schibsted.io/v1 Application resources
    #[arg(long, env = "FIAAS_ENABLE_CRD_SUPPORT")]
    pub enable_crd_support: bool,

    /// Watch legacy schibsted.io/v1beta PaasbetaApplication resources
    #[arg(long, env = "FIAAS_ENABLE_TPR_SUPPORT")]
    pub enable_tpr_support: bool,

    /// Attempts per object when applies hit resourceVersion conflicts
    #[arg(long, env = "FIAAS_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Initial backoff between conflict retries, in milliseconds
    #[arg(long, env = "FIAAS_CONFLICT_BACKOFF_MS", default_value_t = 200)]
    pub conflict_backoff_ms: u64,

    /// Delete objects that no longer apply, e.g. the Ingress of an app whose
    /// ingress rules were removed
    #[arg(
        long,
        env = "FIAAS_PRUNE_REMOVED_OBJECTS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub prune_removed_objects: bool,

    /// Leading component of pipeline task names
    #[arg(long, env = "FIAAS_CALLBACK_TASK_PREFIX", default_value = "fiaas")]
    pub callback_task_prefix: String,

    /// Times a transiently failed deploy is requeued before giving up
    #[arg(long, env = "FIAAS_MAX_REQUEUES", default_value_t = 10)]
    pub max_requeues: u32,
}

/// Service types accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceTypeArg {
    /// Cluster-internal virtual IP
    #[value(name = "ClusterIP")]
    ClusterIp,
    /// Exposed on a port of every node
    #[value(name = "NodePort")]
    NodePort,
}

impl From<ServiceTypeArg> for ServiceType {
    fn from(arg: ServiceTypeArg) -> Self {
        match arg {
            ServiceTypeArg::ClusterIp => ServiceType::ClusterIp,
            ServiceTypeArg::NodePort => ServiceType::NodePort,
        }
    }
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", input)),
    }
}

impl Cli {
    /// Spec source forced by the support flags; None means detect it from
    /// the cluster. CRD support wins when both are set.
    pub fn forced_spec_source(&self) -> Option<SpecSource> {
        if self.enable_crd_support {
            Some(SpecSource::Modern)
        } else if self.enable_tpr_support {
            Some(SpecSource::Legacy)
        } else {
            None
        }
    }

    /// Reconciler settings
    pub fn deployer_config(&self) -> DeployerConfig {
        DeployerConfig {
            derivers: DeriverConfig {
                service_type: self.service_type.into(),
                ingress_suffixes: self.ingress_suffixes.clone(),
                ingress_class: self.ingress_class.clone(),
                global_env: self.global_env.clone(),
                environment: self.environment.clone(),
                infrastructure: self.infrastructure.clone(),
                datadog_image: self.datadog_container_image.clone(),
            },
            apply_retry: RetryConfig::with_max_attempts(self.conflict_retries.max(1))
                .initial_delay(Duration::from_millis(self.conflict_backoff_ms))
                .max_delay(Duration::from_secs(5)),
            prune_removed_objects: self.prune_removed_objects,
            ..Default::default()
        }
    }

    /// Pipeline notification settings
    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            environment: self.environment.clone(),
            infrastructure: self.infrastructure.clone(),
            task_prefix: self.callback_task_prefix.clone(),
            ..Default::default()
        }
    }

    /// Work queue settings
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            requeue: RetryConfig::with_max_attempts(self.max_requeues)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(60)),
            ..Default::default()
        }
    }
}
