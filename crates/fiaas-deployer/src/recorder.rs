//! Kubernetes Events for deploy lifecycle transitions, so progress shows up
//! in `kubectl describe` of the application resource

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;

use fiaas_common::crd::SpecSource;
use fiaas_common::events::{actions, reasons, EventPublisher};
use fiaas_common::Result;
use fiaas_spec::AppSpec;

use crate::bus::{LifecycleEvent, LifecycleSubscriber};

/// Bus subscriber publishing one Kubernetes Event per lifecycle event
pub struct EventRecorder {
    publisher: Arc<dyn EventPublisher>,
    source: SpecSource,
}

impl EventRecorder {
    /// Record events on application resources of the given flavor
    pub fn new(publisher: Arc<dyn EventPublisher>, source: SpecSource) -> Self {
        Self { publisher, source }
    }

    fn reference(&self, app: &AppSpec) -> ObjectReference {
        ObjectReference {
            api_version: Some(format!("{}/{}", self.source.group(), self.source.version())),
            kind: Some(self.source.application_kind().to_string()),
            name: Some(app.name.clone()),
            namespace: Some(app.namespace.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LifecycleSubscriber for EventRecorder {
    fn name(&self) -> &str {
        "event-recorder"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<()> {
        let app = event.app();
        let (type_, reason, note) = match event {
            LifecycleEvent::Started { .. } => (
                EventType::Normal,
                reasons::DEPLOY_STARTED,
                format!("Deploying {} (deployment id {})", app.image, app.deployment_id),
            ),
            LifecycleEvent::Succeeded { .. } => (
                EventType::Normal,
                reasons::DEPLOY_SUCCEEDED,
                format!("Deployed {} (deployment id {})", app.image, app.deployment_id),
            ),
            LifecycleEvent::Failed { result, .. } => {
                let failed: Vec<String> = result
                    .failed_objects()
                    .map(|o| format!("{}/{}: {}", o.kind, o.name, o.outcome))
                    .collect();
                (
                    EventType::Warning,
                    reasons::DEPLOY_FAILED,
                    format!(
                        "Deploy of {} (deployment id {}) failed: {}",
                        app.image,
                        app.deployment_id,
                        failed.join("; ")
                    ),
                )
            }
        };
        self.publisher
            .publish(&self.reference(app), type_, reason, actions::DEPLOY, Some(note))
            .await;
        Ok(())
    }
}
