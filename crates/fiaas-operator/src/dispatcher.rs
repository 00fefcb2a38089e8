//! Per-application work queues
//!
//! Every application gets one worker task with a FIFO queue, so changes to
//! one application are reconciled one at a time and in the order they were
//! observed, while different applications run in parallel.
//!
//! Accepted changes carrying a callback URL register it for their deployment
//! id in the shared [`CallbackRegistry`], before the deploy is queued.
//!
//! A DELETE marks the application as pending deletion: the in-flight
//! reconciliation is cancelled between objects, queued deploys are skipped,
//! and new changes are rejected until the cleanup has run. Reconciliations
//! that failed for transient reasons are requeued with backoff unless a newer
//! change for the same application was accepted in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use fiaas_common::retry::RetryConfig;
use fiaas_common::{Error, Result};
use fiaas_deployer::{CallbackRegistry, ObjectResult, ReconciliationResult, Reconciler};
use fiaas_spec::{normalize, AppSpec};

use crate::watch::{AppChange, Operation};

/// What the dispatcher drives
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppReconciler: Send + Sync {
    /// Reconcile one application spec
    async fn reconcile(&self, app: Arc<AppSpec>, cancel: &CancellationToken) -> ReconciliationResult;

    /// Delete everything derived for a removed application
    async fn cleanup(&self, name: &str, namespace: &str) -> Result<Vec<ObjectResult>>;
}

#[async_trait]
impl AppReconciler for Reconciler {
    async fn reconcile(&self, app: Arc<AppSpec>, cancel: &CancellationToken) -> ReconciliationResult {
        Reconciler::reconcile(self, app, cancel).await
    }

    async fn cleanup(&self, name: &str, namespace: &str) -> Result<Vec<ObjectResult>> {
        Reconciler::cleanup(self, name, namespace).await
    }
}

/// Work queue settings
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Backoff for requeued deploys and cleanups; `max_attempts` bounds the
    /// total number of attempts per change
    pub requeue: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            requeue: RetryConfig::with_max_attempts(10)
                .initial_delay(std::time::Duration::from_secs(1))
                .max_delay(std::time::Duration::from_secs(60)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AppKey {
    namespace: String,
    name: String,
}

#[derive(Debug)]
enum Work {
    Deploy {
        app: Arc<AppSpec>,
        attempt: u32,
        seq: u64,
    },
    Cleanup {
        attempt: u32,
    },
}

struct Worker {
    id: u64,
    queue: mpsc::UnboundedSender<Work>,
    cancel: CancellationToken,
    latest_seq: Arc<AtomicU64>,
    deleting: bool,
}

struct Inner {
    reconciler: Arc<dyn AppReconciler>,
    config: DispatcherConfig,
    callbacks: Arc<CallbackRegistry>,
    workers: DashMap<AppKey, Worker>,
    next_id: AtomicU64,
}

/// Routes application changes to per-application workers
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher driving `reconciler` with a private callback
    /// registry. Must be called inside a Tokio runtime.
    pub fn new(reconciler: Arc<dyn AppReconciler>, config: DispatcherConfig) -> Self {
        Self::with_callbacks(reconciler, config, Arc::new(CallbackRegistry::new()))
    }

    /// Create a dispatcher registering callback URLs in `callbacks`, the
    /// registry the reporter reads
    pub fn with_callbacks(
        reconciler: Arc<dyn AppReconciler>,
        config: DispatcherConfig,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                config,
                callbacks,
                workers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registry of pipeline callback URLs by deployment id
    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    /// Number of applications with a live worker
    pub fn active_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Whether changes to the application are currently rejected
    pub fn is_pending_deletion(&self, namespace: &str, name: &str) -> bool {
        let key = AppKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.inner
            .workers
            .get(&key)
            .map(|worker| worker.deleting)
            .unwrap_or(false)
    }

    /// Accept one change.
    ///
    /// Specs that fail validation are returned as errors and never reach the
    /// reconciler. Creates and updates for an application pending deletion
    /// are rejected with [`Error::PendingDeletion`].
    pub fn dispatch(&self, change: AppChange) -> Result<()> {
        let key = AppKey {
            namespace: change.namespace.clone(),
            name: change.name.clone(),
        };
        match change.operation {
            Operation::Delete => {
                info!(app = %key.name, namespace = %key.namespace, "Application deleted");
                let mut worker = self.worker_for(key);
                worker.deleting = true;
                worker.cancel.cancel();
                self.send(&worker, Work::Cleanup { attempt: 1 });
                Ok(())
            }
            Operation::Create | Operation::Update => {
                let app = Arc::new(normalize(&change.document)?);
                let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let worker = self.worker_for(key);
                if worker.deleting {
                    return Err(Error::pending_deletion(change.name));
                }
                worker.latest_seq.store(seq, Ordering::SeqCst);
                if let Some(url) = &change.callback_url {
                    if !self.inner.callbacks.register(app.deployment_id.clone(), url.clone()) {
                        debug!(deployment_id = %app.deployment_id, "Callback already registered");
                    }
                }
                info!(
                    app = %change.name,
                    namespace = %change.namespace,
                    deployment_id = %change.deployment_id,
                    operation = %change.operation,
                    "Queued application change"
                );
                self.send(
                    &worker,
                    Work::Deploy {
                        app,
                        attempt: 1,
                        seq,
                    },
                );
                Ok(())
            }
        }
    }

    fn worker_for(&self, key: AppKey) -> dashmap::mapref::one::RefMut<'_, AppKey, Worker> {
        match self.inner.workers.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(slot) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let (queue, rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let latest_seq = Arc::new(AtomicU64::new(0));
                tokio::spawn(self.clone().run_worker(
                    slot.key().clone(),
                    id,
                    rx,
                    cancel.clone(),
                    latest_seq.clone(),
                ));
                slot.insert(Worker {
                    id,
                    queue,
                    cancel,
                    latest_seq,
                    deleting: false,
                })
            }
        }
    }

    fn send(&self, worker: &Worker, work: Work) {
        if worker.queue.send(work).is_err() {
            warn!(worker = worker.id, "Worker queue closed, dropping work");
        }
    }

    fn requeue(&self, key: AppKey, work: Work) {
        let delay = match &work {
            Work::Deploy { attempt, .. } | Work::Cleanup { attempt } => {
                self.inner.config.requeue.jittered_delay_for_attempt(*attempt)
            }
        };
        let is_deploy = matches!(work, Work::Deploy { .. });
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match dispatcher.inner.workers.get(&key) {
                Some(worker) if !(is_deploy && worker.deleting) => dispatcher.send(&worker, work),
                _ => debug!(app = %key.name, "Dropping requeue for a finished application"),
            }
        });
    }

    fn attempts_left(&self, attempt: u32) -> bool {
        let max = self.inner.config.requeue.max_attempts;
        max == 0 || attempt < max
    }

    async fn run_worker(
        self,
        key: AppKey,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<Work>,
        cancel: CancellationToken,
        latest_seq: Arc<AtomicU64>,
    ) {
        debug!(app = %key.name, namespace = %key.namespace, worker = id, "Worker started");
        while let Some(work) = rx.recv().await {
            match work {
                Work::Deploy { app, attempt, seq } => {
                    if cancel.is_cancelled() {
                        debug!(app = %key.name, deployment_id = %app.deployment_id, "Skipping deploy of deleted application");
                        continue;
                    }
                    if seq < latest_seq.load(Ordering::SeqCst) && attempt > 1 {
                        debug!(app = %key.name, deployment_id = %app.deployment_id, "Dropping superseded requeue");
                        continue;
                    }
                    let result = self.inner.reconciler.reconcile(app.clone(), &cancel).await;
                    if result.is_retryable() && !cancel.is_cancelled() {
                        if self.attempts_left(attempt) {
                            info!(
                                app = %key.name,
                                deployment_id = %app.deployment_id,
                                attempt,
                                "Requeueing transiently failed deploy"
                            );
                            self.requeue(
                                key.clone(),
                                Work::Deploy {
                                    app,
                                    attempt: attempt + 1,
                                    seq,
                                },
                            );
                        } else {
                            warn!(app = %key.name, deployment_id = %app.deployment_id, attempt, "Giving up on deploy");
                        }
                    }
                }
                Work::Cleanup { attempt } => {
                    match self.inner.reconciler.cleanup(&key.name, &key.namespace).await {
                        Ok(objects) => {
                            info!(app = %key.name, namespace = %key.namespace, deleted = objects.len(), "Removed application objects");
                        }
                        Err(e) if e.is_retryable() && self.attempts_left(attempt) => {
                            warn!(app = %key.name, error = %e, attempt, "Cleanup failed, requeueing");
                            self.requeue(key.clone(), Work::Cleanup { attempt: attempt + 1 });
                            continue;
                        }
                        Err(e) => {
                            warn!(app = %key.name, error = %e, "Cleanup failed, giving up");
                        }
                    }
                    self.inner.workers.remove_if(&key, |_, worker| worker.id == id);
                    debug!(app = %key.name, worker = id, "Worker stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiaas_deployer::{ObjectKind, ObjectOutcome};
    use fiaas_spec::RawSpecDocument;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn change(operation: Operation, name: &str, deployment_id: &str, config: serde_json::Value) -> AppChange {
        AppChange {
            operation,
            name: name.to_string(),
            namespace: "team".to_string(),
            deployment_id: deployment_id.to_string(),
            callback_url: None,
            document: RawSpecDocument::new(name, "team", format!("{}:1", name), deployment_id, config),
        }
    }

    fn deploy(name: &str, deployment_id: &str) -> AppChange {
        change(Operation::Update, name, deployment_id, serde_json::json!({"version": 3}))
    }

    fn result(app: &AppSpec, outcome: ObjectOutcome) -> ReconciliationResult {
        ReconciliationResult::new(
            app.name.clone(),
            app.namespace.clone(),
            app.deployment_id.clone(),
            vec![ObjectResult {
                kind: ObjectKind::Deployment,
                name: app.name.clone(),
                outcome,
            }],
        )
    }

    fn transient() -> ObjectOutcome {
        ObjectOutcome::Failed {
            error: "cluster unavailable".to_string(),
            retryable: true,
        }
    }

    fn fast_requeue(attempts: u32, delay_ms: u64) -> DispatcherConfig {
        DispatcherConfig {
            requeue: RetryConfig::with_max_attempts(attempts)
                .initial_delay(Duration::from_millis(delay_ms))
                .max_delay(Duration::from_millis(delay_ms)),
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Records calls; outcomes are popped per reconcile (default unchanged).
    /// Apps named "slow" block until cancelled.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
        outcomes: Mutex<VecDeque<ObjectOutcome>>,
        started: Notify,
    }

    impl Scripted {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AppReconciler for Scripted {
        async fn reconcile(&self, app: Arc<AppSpec>, cancel: &CancellationToken) -> ReconciliationResult {
            self.calls
                .lock()
                .unwrap()
                .push(format!("deploy:{}:{}", app.name, app.deployment_id));
            self.started.notify_one();
            if app.name == "slow" {
                cancel.cancelled().await;
                return result(&app, ObjectOutcome::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ObjectOutcome::Unchanged);
            result(&app, outcome)
        }

        async fn cleanup(&self, name: &str, _namespace: &str) -> Result<Vec<ObjectResult>> {
            self.calls.lock().unwrap().push(format!("cleanup:{}", name));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn invalid_specs_never_reach_the_reconciler() {
        let mut reconciler = MockAppReconciler::new();
        reconciler.expect_reconcile().never();
        let dispatcher = Dispatcher::new(Arc::new(reconciler), DispatcherConfig::default());

        let err = dispatcher
            .dispatch(change(
                Operation::Create,
                "web",
                "d1",
                serde_json::json!({"version": 99}),
            ))
            .unwrap_err();
        assert!(err.is_spec_error());
        assert_eq!(dispatcher.active_workers(), 0);
    }

    /// Story: three quick changes to one app are applied one at a time, in order
    #[tokio::test]
    async fn story_changes_for_one_app_run_in_order() {
        let reconciler = Arc::new(Scripted::default());
        let dispatcher = Dispatcher::new(reconciler.clone(), DispatcherConfig::default());

        for id in ["d1", "d2", "d3"] {
            dispatcher.dispatch(deploy("web", id)).unwrap();
        }
        dispatcher.dispatch(deploy("api", "a1")).unwrap();

        eventually("all deploys", || reconciler.calls().len() == 4).await;
        let web: Vec<String> = reconciler
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("deploy:web"))
            .collect();
        assert_eq!(web, vec!["deploy:web:d1", "deploy:web:d2", "deploy:web:d3"]);
        assert_eq!(dispatcher.active_workers(), 2);
    }

    /// Story: deleting an app mid-deploy cancels it, rejects further changes
    /// until cleanup ran, then accepts the app again
    #[tokio::test]
    async fn story_delete_cancels_in_flight_and_gates_new_changes() {
        let reconciler = Arc::new(Scripted::default());
        let dispatcher = Dispatcher::new(reconciler.clone(), DispatcherConfig::default());

        dispatcher.dispatch(deploy("slow", "d1")).unwrap();
        reconciler.started.notified().await;
        dispatcher.dispatch(deploy("slow", "d2")).unwrap();

        dispatcher
            .dispatch(change(Operation::Delete, "slow", "d2", serde_json::json!({"version": 3})))
            .unwrap();
        let rejected = dispatcher.dispatch(deploy("slow", "d3")).unwrap_err();
        assert!(matches!(rejected, Error::PendingDeletion { .. }));

        eventually("cleanup", || !dispatcher.is_pending_deletion("team", "slow")).await;
        assert_eq!(reconciler.calls(), vec!["deploy:slow:d1", "cleanup:slow"]);
        assert_eq!(dispatcher.active_workers(), 0);

        dispatcher.dispatch(deploy("slow", "d4")).unwrap();
        eventually("redeploy", || reconciler.calls().len() == 3).await;
    }

    /// Story: a change annotated with a callback registers it in the registry
    /// shared with the reporter; rejected changes register nothing
    #[tokio::test]
    async fn story_accepted_changes_register_their_callback() {
        let callbacks = Arc::new(CallbackRegistry::new());
        let reconciler = Arc::new(Scripted::default());
        let dispatcher =
            Dispatcher::with_callbacks(reconciler.clone(), DispatcherConfig::default(), callbacks.clone());

        let mut annotated = deploy("slow", "d1");
        annotated.callback_url = Some("http://pipeline.example/cb".to_string());
        dispatcher.dispatch(annotated).unwrap();
        assert_eq!(callbacks.get("d1").as_deref(), Some("http://pipeline.example/cb"));
        assert!(Arc::ptr_eq(dispatcher.callbacks(), &callbacks));

        reconciler.started.notified().await;
        dispatcher
            .dispatch(change(Operation::Delete, "slow", "d1", serde_json::json!({"version": 3})))
            .unwrap();
        let mut rejected = deploy("slow", "d2");
        rejected.callback_url = Some("http://pipeline.example/cb".to_string());
        assert!(dispatcher.dispatch(rejected).is_err());
        assert!(callbacks.get("d2").is_none());

        dispatcher.dispatch(deploy("web", "d3")).unwrap();
        assert!(callbacks.get("d3").is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_requeued_until_they_succeed() {
        let reconciler = Arc::new(Scripted::default());
        reconciler
            .outcomes
            .lock()
            .unwrap()
            .extend([transient(), transient(), ObjectOutcome::Updated]);
        let dispatcher = Dispatcher::new(reconciler.clone(), fast_requeue(5, 1));

        dispatcher.dispatch(deploy("web", "d1")).unwrap();

        eventually("three attempts", || reconciler.calls().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reconciler.calls(), vec!["deploy:web:d1"; 3]);
    }

    #[tokio::test]
    async fn requeues_stop_at_the_attempt_ceiling() {
        let reconciler = Arc::new(Scripted::default());
        reconciler
            .outcomes
            .lock()
            .unwrap()
            .extend(std::iter::repeat_with(transient).take(10));
        let dispatcher = Dispatcher::new(reconciler.clone(), fast_requeue(2, 1));

        dispatcher.dispatch(deploy("web", "d1")).unwrap();

        eventually("two attempts", || reconciler.calls().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reconciler.calls().len(), 2);
    }

    #[tokio::test]
    async fn superseded_requeues_are_dropped() {
        let reconciler = Arc::new(Scripted::default());
        reconciler.outcomes.lock().unwrap().push_back(transient());
        let dispatcher = Dispatcher::new(reconciler.clone(), fast_requeue(5, 40));

        dispatcher.dispatch(deploy("web", "d1")).unwrap();
        eventually("first deploy", || reconciler.calls().len() == 1).await;
        dispatcher.dispatch(deploy("web", "d2")).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reconciler.calls(), vec!["deploy:web:d1", "deploy:web:d2"]);
    }

    #[tokio::test]
    async fn spec_failures_are_not_requeued() {
        let mut reconciler = MockAppReconciler::new();
        reconciler.expect_reconcile().times(1).returning(|app, _| {
            result(
                &app,
                ObjectOutcome::Failed {
                    error: "forbidden".to_string(),
                    retryable: false,
                },
            )
        });
        let dispatcher = Dispatcher::new(Arc::new(reconciler), fast_requeue(5, 1));

        dispatcher.dispatch(deploy("web", "d1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn transient_cleanup_failures_are_retried() {
        let mut reconciler = MockAppReconciler::new();
        let mut seq = mockall::Sequence::new();
        reconciler
            .expect_cleanup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::cluster_unavailable("connection reset")));
        reconciler
            .expect_cleanup()
            .withf(|name, namespace| name == "web" && namespace == "team")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Vec::new()));
        let dispatcher = Dispatcher::new(Arc::new(reconciler), fast_requeue(3, 1));

        dispatcher
            .dispatch(change(Operation::Delete, "web", "d1", serde_json::json!({"version": 3})))
            .unwrap();

        eventually("cleanup retried", || dispatcher.active_workers() == 0).await;
    }
}
