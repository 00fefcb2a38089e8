//! End-to-end tests for the reconciliation pipeline
//!
//! Drives normalize → reconcile → status → reporter against an in-memory
//! cluster that hands out resourceVersions and rejects stale writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use fiaas_common::crd::DeployResult;
use fiaas_common::retry::RetryConfig;
use fiaas_common::{Error, Result};
use fiaas_deployer::{
    CallbackRegistry, ClusterClient, DeployerConfig, EventBus, InMemoryStatusStore, ManagedObject,
    NotificationSender, ObjectKind, ObjectOutcome, Reconciler, Reporter, ReporterConfig,
    StatusTracker,
};
use fiaas_spec::{normalize, AppSpec, RawSpecDocument};

type ObjectKey = (ObjectKind, String, String);

/// Cluster double with optimistic concurrency on replace
#[derive(Default)]
struct InMemoryCluster {
    objects: Mutex<HashMap<ObjectKey, ManagedObject>>,
    next_version: AtomicU64,
    /// Number of upcoming replaces per kind that lose a race
    conflicts: Mutex<HashMap<ObjectKind, u32>>,
    writes: Mutex<Vec<(ObjectKind, &'static str)>>,
}

impl InMemoryCluster {
    fn stamp(&self, object: &ManagedObject) -> ManagedObject {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut value = object.to_json().unwrap();
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
        match object.kind() {
            ObjectKind::Deployment => ManagedObject::Deployment(serde_json::from_value(value).unwrap()),
            ObjectKind::Service => ManagedObject::Service(serde_json::from_value(value).unwrap()),
            ObjectKind::Ingress => ManagedObject::Ingress(serde_json::from_value(value).unwrap()),
            ObjectKind::Autoscaler => ManagedObject::Autoscaler(serde_json::from_value(value).unwrap()),
        }
    }

    fn key(kind: ObjectKind, namespace: &str, name: &str) -> ObjectKey {
        (kind, namespace.to_string(), name.to_string())
    }

    fn inject_conflicts(&self, kind: ObjectKind, count: u32) {
        self.conflicts.lock().unwrap().insert(kind, count);
    }

    fn stored(&self, kind: ObjectKind, name: &str) -> Option<ManagedObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key(kind, "default", name))
            .cloned()
    }

    fn take_writes(&self) -> Vec<(ObjectKind, &'static str)> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<Option<ManagedObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&Self::key(kind, namespace, name))
            .cloned())
    }

    async fn create(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let key = Self::key(object.kind(), object.namespace(), object.name());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::conflict(object.kind().as_str(), object.name(), "already exists"));
        }
        let stored = self.stamp(object);
        objects.insert(key, stored.clone());
        self.writes.lock().unwrap().push((object.kind(), "create"));
        Ok(stored)
    }

    async fn replace(&self, object: &ManagedObject) -> Result<ManagedObject> {
        let key = Self::key(object.kind(), object.namespace(), object.name());
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key).cloned() else {
            return Err(Error::internal("replace of missing object"));
        };

        let mut conflicts = self.conflicts.lock().unwrap();
        if let Some(remaining) = conflicts.get_mut(&object.kind()).filter(|n| **n > 0) {
            // a concurrent writer bumps the version first
            *remaining -= 1;
            objects.insert(key, self.stamp(&current));
            return Err(Error::conflict(object.kind().as_str(), object.name(), "object has been modified"));
        }
        if current.resource_version() != object.resource_version() {
            return Err(Error::conflict(object.kind().as_str(), object.name(), "stale resourceVersion"));
        }
        let stored = self.stamp(object);
        objects.insert(key, stored.clone());
        self.writes.lock().unwrap().push((object.kind(), "replace"));
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .remove(&Self::key(kind, namespace, name))
            .is_some())
    }
}

#[derive(Default)]
struct RecordingSender {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, url: &str, _body: &Value) -> Result<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

struct Harness {
    cluster: Arc<InMemoryCluster>,
    tracker: Arc<StatusTracker>,
    registry: Arc<CallbackRegistry>,
    sender: Arc<RecordingSender>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let cluster = Arc::new(InMemoryCluster::default());
        let tracker = Arc::new(StatusTracker::new(Arc::new(InMemoryStatusStore::new())));
        let registry = Arc::new(CallbackRegistry::new());
        let sender = Arc::new(RecordingSender::default());
        let reporter = Reporter::new(
            registry.clone(),
            sender.clone(),
            ReporterConfig {
                environment: "dev".to_string(),
                infrastructure: "diy".to_string(),
                ..Default::default()
            },
        );
        let bus = EventBus::builder()
            .subscribe(tracker.clone())
            .subscribe(Arc::new(reporter.spawn()))
            .build();
        let config = DeployerConfig {
            apply_retry: RetryConfig::with_max_attempts(4)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5)),
            controller_version: "1.0.0".to_string(),
            ..Default::default()
        };
        let reconciler = Reconciler::new(cluster.clone(), bus, config);
        Self {
            cluster,
            tracker,
            registry,
            sender,
            reconciler,
        }
    }

    async fn deploy(&self, spec: AppSpec) -> fiaas_deployer::ReconciliationResult {
        self.reconciler
            .reconcile(Arc::new(spec), &CancellationToken::new())
            .await
    }

    /// Notifications are delivered on a background task
    async fn wait_for_notifications(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            if self.sender.urls.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sender.urls.lock().unwrap().clone()
    }
}

const V2_CONFIG: &str = r#"
version: 2
host: web.example.com
ports:
  - target_port: 8080
"#;

fn v2_spec(image: &str, deployment_id: &str) -> AppSpec {
    let config: Value = serde_yaml::from_str(V2_CONFIG).unwrap();
    normalize(&RawSpecDocument::new("web", "default", image, deployment_id, config)).unwrap()
}

fn deployment(cluster: &InMemoryCluster) -> Deployment {
    match cluster.stored(ObjectKind::Deployment, "web") {
        Some(ManagedObject::Deployment(d)) => d,
        other => panic!("expected a Deployment, found {:?}", other),
    }
}

/// Story: a v2 app is created, then redeployed in place under a new
/// deployment id, and both deploys stay queryable
#[tokio::test]
async fn story_v2_app_is_created_then_redeployed_in_place() {
    let harness = Harness::new();
    assert!(harness.registry.register("d1", "http://pipeline.example/cb"));

    let first = harness.deploy(v2_spec("registry.io/web:1", "d1")).await;
    assert_eq!(first.status, DeployResult::Running);
    let kinds: Vec<_> = first.objects.iter().map(|o| (o.kind, o.outcome.clone())).collect();
    assert_eq!(
        kinds,
        vec![
            (ObjectKind::Deployment, ObjectOutcome::Created),
            (ObjectKind::Service, ObjectOutcome::Created),
            (ObjectKind::Ingress, ObjectOutcome::Created),
        ]
    );
    assert!(harness.cluster.stored(ObjectKind::Autoscaler, "web").is_none());
    let Some(ManagedObject::Ingress(ingress)) = harness.cluster.stored(ObjectKind::Ingress, "web") else {
        panic!("expected an Ingress");
    };
    let rules = ingress.spec.unwrap().rules.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].host.as_deref(), Some("web.example.com"));

    let first_version = deployment(&harness.cluster).metadata.resource_version;
    harness.cluster.take_writes();

    let second = harness.deploy(v2_spec("registry.io/web:2", "d2")).await;
    assert_eq!(second.status, DeployResult::Running);
    assert!(second
        .objects
        .iter()
        .all(|o| o.outcome == ObjectOutcome::Updated));
    assert!(harness
        .cluster
        .take_writes()
        .iter()
        .all(|(_, op)| *op == "replace"));

    let live = deployment(&harness.cluster);
    assert_ne!(live.metadata.resource_version, first_version);
    assert_eq!(live.metadata.name.as_deref(), Some("web"));
    let labels = live.metadata.labels.as_ref().unwrap();
    assert_eq!(labels["fiaas/version"], "2");
    assert_eq!(labels["fiaas/deployment_id"], "d2");
    let container = &live.spec.unwrap().template.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("registry.io/web:2"));

    let old = harness.tracker.get("default", "web", "d1").await.unwrap().unwrap();
    let new = harness.tracker.get("default", "web", "d2").await.unwrap().unwrap();
    assert_eq!(old.result, DeployResult::Running);
    assert_eq!(new.result, DeployResult::Running);
    assert_eq!(old.objects.len(), 3);

    let urls = harness.wait_for_notifications(2).await;
    assert_eq!(
        urls,
        vec![
            "http://pipeline.example/cb/fiaas_dev-diy_deploy_started/success".to_string(),
            "http://pipeline.example/cb/fiaas_dev-diy_deploy_end/success".to_string(),
        ]
    );
    assert!(harness.registry.get("d1").is_none());
}

/// Story: reconciling an unchanged spec writes nothing
#[tokio::test]
async fn story_unchanged_spec_is_a_noop() {
    let harness = Harness::new();
    let spec = v2_spec("registry.io/web:1", "d1");

    harness.deploy(spec.clone()).await;
    harness.cluster.take_writes();
    let again = harness.deploy(spec).await;

    assert!(again.succeeded());
    assert!(again
        .objects
        .iter()
        .all(|o| o.outcome == ObjectOutcome::Unchanged));
    assert!(harness.cluster.take_writes().is_empty());
}

/// Story: lost races below the retry ceiling still converge
#[tokio::test]
async fn story_conflicts_are_retried_until_applied() {
    let harness = Harness::new();
    harness.deploy(v2_spec("registry.io/web:1", "d1")).await;

    harness.cluster.inject_conflicts(ObjectKind::Deployment, 2);
    let result = harness.deploy(v2_spec("registry.io/web:2", "d2")).await;

    assert!(result.succeeded());
    assert_eq!(result.objects[0].outcome, ObjectOutcome::Updated);
    let container = &deployment(&harness.cluster)
        .spec
        .unwrap()
        .template
        .spec
        .unwrap()
        .containers[0];
    assert_eq!(container.image.as_deref(), Some("registry.io/web:2"));
}

/// Story: exhausting retries fails only the contended object
#[tokio::test]
async fn story_exhausted_conflicts_fail_one_object() {
    let harness = Harness::new();
    harness.deploy(v2_spec("registry.io/web:1", "d1")).await;

    harness.cluster.inject_conflicts(ObjectKind::Ingress, 10);
    let result = harness.deploy(v2_spec("registry.io/web:2", "d2")).await;

    assert_eq!(result.status, DeployResult::Failed);
    let failed: Vec<_> = result.failed_objects().map(|o| o.kind).collect();
    assert_eq!(failed, vec![ObjectKind::Ingress]);
    assert!(harness.cluster.stored(ObjectKind::Service, "web").is_some());

    let record = harness.tracker.get("default", "web", "d2").await.unwrap().unwrap();
    assert_eq!(record.result, DeployResult::Failed);
    let ingress = record.objects.iter().find(|o| o.kind == "Ingress").unwrap();
    assert!(ingress.error.as_deref().unwrap().contains("Ingress/web"));
}

/// Story: deployments without a callback send nothing
#[tokio::test]
async fn story_unregistered_deployments_are_not_reported() {
    let harness = Harness::new();
    harness.registry.register("d1", "http://pipeline.example/cb");

    harness.deploy(v2_spec("registry.io/web:9", "d9")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.sender.urls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_removes_all_objects() {
    let harness = Harness::new();
    harness.deploy(v2_spec("registry.io/web:1", "d1")).await;

    let deleted = harness.reconciler.cleanup("web", "default").await.unwrap();

    assert_eq!(deleted.len(), 3);
    for kind in ObjectKind::ALL {
        assert!(harness.cluster.stored(kind, "web").is_none());
    }
}
