//! One reconciliation attempt for one application
//!
//! Derive every object, apply each independently, aggregate the outcomes
//! and announce start and finish on the event bus. A failed object does not
//! stop or roll back its siblings; the next attempt picks it up again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fiaas_common::metrics::ReconcileTimer;
use fiaas_common::retry::RetryConfig;
use fiaas_common::Result;
use fiaas_spec::AppSpec;

use crate::apply::apply_object;
use crate::bus::{EventBus, LifecycleEvent};
use crate::cluster::ClusterClient;
use crate::derive::{default_derivers, Derived, Deriver, DeriverConfig};
use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};
use crate::result::{ObjectOutcome, ObjectResult, ReconciliationResult};

/// Settings for the reconciler
#[derive(Clone, Debug)]
pub struct DeployerConfig {
    /// Cluster settings shared by the derivers
    pub derivers: DeriverConfig,
    /// Backoff for optimistic-concurrency conflicts, per object
    pub apply_retry: RetryConfig,
    /// Delete objects whose kind no longer applies to the application
    pub prune_removed_objects: bool,
    /// Reported as `fiaas/deployed_by`
    pub controller_version: String,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            derivers: DeriverConfig::default(),
            apply_retry: RetryConfig::with_max_attempts(5)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(5)),
            prune_removed_objects: true,
            controller_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Drives derived objects towards an [`AppSpec`]
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    bus: EventBus,
    derivers: Vec<Box<dyn Deriver>>,
    config: DeployerConfig,
}

impl Reconciler {
    /// Create a reconciler applying through `client` and announcing on `bus`
    pub fn new(client: Arc<dyn ClusterClient>, bus: EventBus, config: DeployerConfig) -> Self {
        Self {
            client,
            bus,
            derivers: default_derivers(&config.derivers),
            config,
        }
    }

    /// Reconcile `app` once.
    ///
    /// `cancel` is checked between objects: the object being applied when it
    /// fires is finished, the rest are reported as cancelled.
    #[instrument(
        skip(self, app, cancel),
        fields(app = %app.name, namespace = %app.namespace, deployment_id = %app.deployment_id)
    )]
    pub async fn reconcile(&self, app: Arc<AppSpec>, cancel: &CancellationToken) -> ReconciliationResult {
        let timer = ReconcileTimer::start(app.name.clone());
        let identity = IdentityMetadata::for_app(&app, &self.config.controller_version);
        self.bus
            .publish(&LifecycleEvent::Started { app: app.clone() })
            .await;

        let preserve_replicas = app.autoscaler.is_some();
        let mut objects = Vec::with_capacity(self.derivers.len());
        for deriver in &self.derivers {
            let kind = deriver.kind();
            let name = kind.object_name(&app.name);
            if cancel.is_cancelled() {
                objects.push(ObjectResult {
                    kind,
                    name,
                    outcome: ObjectOutcome::Cancelled,
                });
                continue;
            }
            let outcome = match deriver.derive(&app, &identity) {
                Derived::Object(desired) => Some(self.apply(desired, preserve_replicas).await),
                Derived::NotApplicable => self.remove_inapplicable(kind, &app.namespace, &name).await,
            };
            if let Some(outcome) = outcome {
                objects.push(ObjectResult {
                    kind,
                    name,
                    outcome,
                });
            }
        }

        let result = Arc::new(ReconciliationResult::new(
            app.name.clone(),
            app.namespace.clone(),
            app.deployment_id.clone(),
            objects,
        ));
        if result.succeeded() {
            info!(objects = result.objects.len(), "Reconciliation succeeded");
        } else {
            let failed: Vec<String> = result
                .failed_objects()
                .map(|o| format!("{}/{}", o.kind, o.name))
                .collect();
            warn!(failed = ?failed, retryable = result.is_retryable(), "Reconciliation failed");
        }
        timer.finish(result.status.as_str());

        self.bus
            .publish(&LifecycleEvent::finished(app, result.clone()))
            .await;
        Arc::try_unwrap(result).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Delete every object derived for an application that no longer exists.
    /// Every kind is attempted; the first error is returned.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, name: &str, namespace: &str) -> Result<Vec<ObjectResult>> {
        let mut deleted = Vec::new();
        let mut first_error = None;
        // autoscaler first so it stops scaling a deployment that is going away
        for kind in ObjectKind::ALL.into_iter().rev() {
            let object_name = kind.object_name(name);
            match self.client.delete(kind, namespace, &object_name).await {
                Ok(true) => {
                    debug!(kind = %kind, "Deleted object");
                    deleted.push(ObjectResult {
                        kind,
                        name: object_name,
                        outcome: ObjectOutcome::Deleted,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Failed to delete object");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(deleted = deleted.len(), "Cleaned up application objects");
                Ok(deleted)
            }
        }
    }

    async fn apply(&self, desired: ManagedObject, preserve_replicas: bool) -> ObjectOutcome {
        let kind = desired.kind();
        let applied = match desired.with_desired_hash() {
            Ok(desired) => {
                apply_object(
                    self.client.as_ref(),
                    &desired,
                    &self.config.apply_retry,
                    preserve_replicas,
                )
                .await
            }
            Err(e) => Err(e),
        };
        match applied {
            Ok(outcome) => {
                debug!(kind = %kind, outcome = %outcome, "Applied object");
                outcome
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to apply object");
                ObjectOutcome::Failed {
                    retryable: e.is_retryable(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// None when there is nothing to report for the kind
    async fn remove_inapplicable(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<ObjectOutcome> {
        if !self.config.prune_removed_objects {
            return None;
        }
        match self.client.delete(kind, namespace, name).await {
            Ok(true) => {
                info!(kind = %kind, "Deleted object no longer declared by the application");
                Some(ObjectOutcome::Deleted)
            }
            Ok(false) => None,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to delete object no longer declared by the application");
                Some(ObjectOutcome::Failed {
                    retryable: e.is_retryable(),
                    error: e.to_string(),
                })
            }
        }
    }
}
