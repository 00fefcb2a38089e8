//! Pipeline notifications for deployments with a registered callback
//!
//! A caller registers a callback URL for a deployment id. Lifecycle events
//! for that deployment id are then posted to
//! `<callback>/<prefix>_<environment>-<infrastructure>_<event>/<status>`.
//! Delivery runs on one background task, in publish order, and failures are
//! only logged. The registration is dropped once the deploy has reached a
//! final result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use fiaas_common::metrics::record_notification;
use fiaas_common::{Error, Result, CONTROLLER_NAME};

use crate::bus::{LifecycleEvent, LifecycleSubscriber};

/// Callback URLs by deployment id. Entries are write-once and live until
/// cleared.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    urls: DashMap<String, String>,
}

impl CallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `url` for `deployment_id`. Returns false, keeping the
    /// existing URL, if one is already registered.
    pub fn register(&self, deployment_id: impl Into<String>, url: impl Into<String>) -> bool {
        match self.urls.entry(deployment_id.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(url.into());
                true
            }
        }
    }

    /// Registered URL for `deployment_id`
    pub fn get(&self, deployment_id: &str) -> Option<String> {
        self.urls.get(deployment_id).map(|url| url.clone())
    }

    /// Remove the registration for `deployment_id`
    pub fn clear(&self, deployment_id: &str) -> Option<String> {
        self.urls.remove(deployment_id).map(|(_, url)| url)
    }
}

/// Naming and transport settings for notifications
#[derive(Clone, Debug)]
pub struct ReporterConfig {
    /// Environment name used in task names
    pub environment: String,
    /// Infrastructure name used in task names
    pub infrastructure: String,
    /// Leading component of task names
    pub task_prefix: String,
    /// `description` field of every notification body
    pub description: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            environment: String::new(),
            infrastructure: String::new(),
            task_prefix: "fiaas".to_string(),
            description: format!("From {}", CONTROLLER_NAME),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outbound transport for notifications
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// POST `body` as JSON to `url`
    async fn send(&self, url: &str, body: &Value) -> Result<()>;
}

/// [`NotificationSender`] over HTTP
pub struct HttpNotificationSender {
    client: reqwest::Client,
}

impl HttpNotificationSender {
    /// Build a sender whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("reporter", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationSender for HttpNotificationSender {
    async fn send(&self, url: &str, body: &Value) -> Result<()> {
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::notification(url, e.to_string()))?;
        Ok(())
    }
}

/// Posts lifecycle notifications for deployments with a registered callback
#[derive(Clone)]
pub struct Reporter {
    registry: Arc<CallbackRegistry>,
    sender: Arc<dyn NotificationSender>,
    config: Arc<ReporterConfig>,
}

impl Reporter {
    /// Create a reporter reading callbacks from `registry`
    pub fn new(
        registry: Arc<CallbackRegistry>,
        sender: Arc<dyn NotificationSender>,
        config: ReporterConfig,
    ) -> Self {
        Self {
            registry,
            sender,
            config: Arc::new(config),
        }
    }

    /// Task name for an event, e.g. `fiaas_dev-diy_deploy_started`
    pub fn task_name(&self, event_name: &str) -> String {
        format!(
            "{}_{}-{}_{}",
            self.config.task_prefix, self.config.environment, self.config.infrastructure, event_name
        )
    }

    /// Send the notification for `event`, if its deployment id has a
    /// callback. Returns whether a notification was sent.
    pub async fn notify(&self, event: &LifecycleEvent) -> Result<bool> {
        let deployment_id = &event.app().deployment_id;
        let Some(base) = self.registry.get(deployment_id) else {
            debug!(deployment_id = %deployment_id, "No callback registered");
            return Ok(false);
        };
        let (event_name, status) = match event {
            LifecycleEvent::Started { .. } => ("deploy_started", "success"),
            LifecycleEvent::Succeeded { .. } => ("deploy_end", "success"),
            LifecycleEvent::Failed { .. } => ("deploy_end", "failure"),
        };
        let url = format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            self.task_name(event_name),
            status
        );
        let body = json!({ "description": self.config.description });

        let outcome = self.sender.send(&url, &body).await;
        record_notification(event_name, outcome.is_ok());
        if let Some(result) = event.result() {
            if result.succeeded() || !result.is_retryable() {
                self.registry.clear(deployment_id);
            }
        }
        outcome?;
        info!(
            app = %event.app().name,
            deployment_id = %deployment_id,
            url = %url,
            "Sent pipeline notification"
        );
        Ok(true)
    }

    /// Start the delivery task and return the bus subscriber feeding it.
    /// Must be called inside a Tokio runtime.
    pub fn spawn(self) -> ReporterHandle {
        let (queue, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.notify(&event).await {
                    warn!(
                        app = %event.app().name,
                        deployment_id = %event.app().deployment_id,
                        event = event.name(),
                        error = %e,
                        "Pipeline notification failed"
                    );
                }
            }
            debug!("Reporter queue closed");
        });
        ReporterHandle { queue }
    }
}

/// Bus subscriber queueing events for the [`Reporter`] delivery task
#[derive(Clone)]
pub struct ReporterHandle {
    queue: mpsc::UnboundedSender<LifecycleEvent>,
}

#[async_trait]
impl LifecycleSubscriber for ReporterHandle {
    fn name(&self) -> &str {
        "reporter"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        self.queue
            .send(event.clone())
            .map_err(|_| Error::internal_with_context("reporter", "delivery task stopped"))
    }
}
