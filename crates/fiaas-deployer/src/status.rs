//! Reconciliation status persistence
//!
//! Results are stored as one status resource per (application, deployment
//! id). The tracker keeps a write-through cache so a status written by this
//! process is immediately readable by it.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use fiaas_common::crd::{StatusRecord, StatusResource};
use fiaas_common::kube_utils::status_name;
use fiaas_common::{Error, Result, APP_LABEL, FIELD_MANAGER};

use crate::bus::{LifecycleEvent, LifecycleSubscriber};
use crate::result::ReconciliationResult;

/// Status records kept per application by default
pub const DEFAULT_RETAINED_STATUSES: usize = 10;

type StatusKey = (String, String, String);

fn key(namespace: &str, app: &str, deployment_id: &str) -> StatusKey {
    (
        namespace.to_string(),
        app.to_string(),
        deployment_id.to_string(),
    )
}

/// Durable storage for status records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write the record, replacing any record for the same deployment id
    async fn save(&self, namespace: &str, record: &StatusRecord) -> Result<()>;

    /// Read the record for one deployment id
    async fn load(
        &self,
        namespace: &str,
        app: &str,
        deployment_id: &str,
    ) -> Result<Option<StatusRecord>>;
}

/// [`StatusStore`] writing status custom resources of kind `S`
pub struct KubeStatusStore<S> {
    client: Client,
    retain: usize,
    _kind: PhantomData<fn() -> S>,
}

impl<S: StatusResource> KubeStatusStore<S> {
    /// Store keeping [`DEFAULT_RETAINED_STATUSES`] records per application
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retain: DEFAULT_RETAINED_STATUSES,
            _kind: PhantomData,
        }
    }

    /// Override how many records are kept per application
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    fn api(&self, namespace: &str) -> Api<S> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Delete the oldest records beyond the retention limit. Best effort.
    async fn prune(&self, namespace: &str, app: &str, keep: &str) {
        let params = ListParams::default().labels(&format!("{}={}", APP_LABEL, app));
        let list = match self.api(namespace).list(&params).await {
            Ok(list) => list,
            Err(e) => {
                warn!(app = %app, error = %e, "Failed to list status records for pruning");
                return;
            }
        };
        let mut items = list.items;
        items.sort_by_key(|s| std::cmp::Reverse(s.creation_timestamp().map(|t| t.0)));
        let stale = items
            .iter()
            .map(|s| s.name_any())
            .filter(|name| name != keep)
            .skip(self.retain.saturating_sub(1));
        for name in stale {
            debug!(app = %app, status = %name, "Pruning old status record");
            if let Err(e) = self.api(namespace).delete(&name, &DeleteParams::default()).await {
                warn!(app = %app, status = %name, error = %e, "Failed to prune status record");
            }
        }
    }
}

#[async_trait]
impl<S: StatusResource> StatusStore for KubeStatusStore<S> {
    async fn save(&self, namespace: &str, record: &StatusRecord) -> Result<()> {
        let resource = S::for_record(namespace, record.clone());
        let name = resource.name_any();
        self.api(namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&resource),
            )
            .await
            .map_err(|e| Error::from_kube_for_object(S::kind(&()), &name, e))?;
        self.prune(namespace, &record.app, &name).await;
        Ok(())
    }

    async fn load(
        &self,
        namespace: &str,
        app: &str,
        deployment_id: &str,
    ) -> Result<Option<StatusRecord>> {
        let name = status_name(app, deployment_id);
        let found = self
            .api(namespace)
            .get_opt(&name)
            .await
            .map_err(|e| Error::from_kube_for_object(S::kind(&()), &name, e))?;
        Ok(found.map(|s| s.record().clone()))
    }
}

/// [`StatusStore`] held in memory; for tests and dry runs
#[derive(Default)]
pub struct InMemoryStatusStore {
    records: DashMap<StatusKey, StatusRecord>,
}

impl InMemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn save(&self, namespace: &str, record: &StatusRecord) -> Result<()> {
        self.records.insert(
            key(namespace, &record.app, &record.deployment_id),
            record.clone(),
        );
        Ok(())
    }

    async fn load(
        &self,
        namespace: &str,
        app: &str,
        deployment_id: &str,
    ) -> Result<Option<StatusRecord>> {
        Ok(self
            .records
            .get(&key(namespace, app, deployment_id))
            .map(|r| r.clone()))
    }
}

/// Records reconciliation results and answers status queries
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
    cache: DashMap<StatusKey, StatusRecord>,
}

impl StatusTracker {
    /// Create a tracker persisting to `store`
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Persist `result` under its application and deployment id.
    ///
    /// The record is readable through [`StatusTracker::get`] as soon as this
    /// is called, even if persisting it fails.
    pub async fn record(&self, result: &ReconciliationResult) -> Result<()> {
        let record = result.to_status_record();
        self.cache.insert(
            key(&result.namespace, &record.app, &record.deployment_id),
            record.clone(),
        );
        self.store.save(&result.namespace, &record).await
    }

    /// Last known record for one deployment id
    pub async fn get(
        &self,
        namespace: &str,
        app: &str,
        deployment_id: &str,
    ) -> Result<Option<StatusRecord>> {
        let key = key(namespace, app, deployment_id);
        if let Some(record) = self.cache.get(&key) {
            return Ok(Some(record.clone()));
        }
        let loaded = self.store.load(namespace, app, deployment_id).await?;
        if let Some(record) = &loaded {
            self.cache.insert(key, record.clone());
        }
        Ok(loaded)
    }
}

#[async_trait]
impl LifecycleSubscriber for StatusTracker {
    fn name(&self) -> &str {
        "status-tracker"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        match event.result() {
            Some(result) => self.record(result).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use crate::result::{ObjectOutcome, ObjectResult};
    use fiaas_common::crd::DeployResult;

    fn result(deployment_id: &str, outcome: ObjectOutcome) -> ReconciliationResult {
        ReconciliationResult::new(
            "web",
            "default",
            deployment_id,
            vec![ObjectResult {
                kind: ObjectKind::Deployment,
                name: "web".to_string(),
                outcome,
            }],
        )
    }

    /// Story: every deployment id keeps its own record
    #[tokio::test]
    async fn story_records_are_keyed_by_deployment_id() {
        let store = Arc::new(InMemoryStatusStore::new());
        let tracker = StatusTracker::new(store.clone());

        tracker
            .record(&result("d1", ObjectOutcome::Created))
            .await
            .unwrap();
        tracker
            .record(&result(
                "d2",
                ObjectOutcome::Failed {
                    error: "boom".to_string(),
                    retryable: false,
                },
            ))
            .await
            .unwrap();

        let first = tracker.get("default", "web", "d1").await.unwrap().unwrap();
        let second = tracker.get("default", "web", "d2").await.unwrap().unwrap();
        assert_eq!(first.result, DeployResult::Running);
        assert_eq!(second.result, DeployResult::Failed);
        assert_eq!(second.objects[0].error.as_deref(), Some("boom"));
        assert!(tracker.get("default", "web", "d3").await.unwrap().is_none());
        assert!(tracker.get("other", "web", "d1").await.unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn reads_fall_through_to_the_store() {
        let mut store = MockStatusStore::new();
        store.expect_load().times(1).returning(|_, app, id| {
            Ok(Some(StatusRecord {
                result: DeployResult::Running,
                app: app.to_string(),
                deployment_id: id.to_string(),
                objects: vec![],
            }))
        });
        let tracker = StatusTracker::new(Arc::new(store));

        // second read is served from the cache
        for _ in 0..2 {
            let record = tracker.get("default", "web", "d1").await.unwrap().unwrap();
            assert_eq!(record.deployment_id, "d1");
        }
    }

    #[tokio::test]
    async fn failed_persist_is_still_readable_locally() {
        let mut store = MockStatusStore::new();
        store
            .expect_save()
            .returning(|_, _| Err(Error::cluster_unavailable("apiserver down")));
        store.expect_load().never();
        let tracker = StatusTracker::new(Arc::new(store));

        let err = tracker
            .record(&result("d1", ObjectOutcome::Updated))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let record = tracker.get("default", "web", "d1").await.unwrap().unwrap();
        assert_eq!(record.result, DeployResult::Running);
    }

    #[tokio::test]
    async fn subscriber_records_finished_events_only() {
        let mut store = MockStatusStore::new();
        store.expect_save().times(1).returning(|_, _| Ok(()));
        let tracker = StatusTracker::new(Arc::new(store));

        let app = Arc::new(
            fiaas_spec::normalize(&fiaas_spec::RawSpecDocument::new(
                "web",
                "default",
                "web:1",
                "d1",
                serde_json::json!({"version": 3}),
            ))
            .unwrap(),
        );
        tracker
            .on_event(&LifecycleEvent::Started { app: app.clone() })
            .await
            .unwrap();
        let finished = Arc::new(result("d1", ObjectOutcome::Created));
        tracker
            .on_event(&LifecycleEvent::finished(app, finished))
            .await
            .unwrap();
    }
}
