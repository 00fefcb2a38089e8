//! In-process lifecycle event bus
//!
//! The reconciler publishes `started`, `succeeded` and `failed`; the status
//! tracker, reporter and event recorder subscribe when the bus is built.
//! Delivery is sequential in subscription order and a failing or panicking
//! subscriber never reaches the publisher.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, warn};

use fiaas_common::Result;
use fiaas_spec::AppSpec;

use crate::result::ReconciliationResult;

/// A reconciliation lifecycle transition
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// Reconciliation began
    Started {
        /// Spec being reconciled
        app: Arc<AppSpec>,
    },
    /// Every object reached its desired state
    Succeeded {
        /// Spec that was reconciled
        app: Arc<AppSpec>,
        /// Final result
        result: Arc<ReconciliationResult>,
    },
    /// At least one object failed or the attempt was cancelled
    Failed {
        /// Spec that was reconciled
        app: Arc<AppSpec>,
        /// Final result
        result: Arc<ReconciliationResult>,
    },
}

impl LifecycleEvent {
    /// Event for a finished reconciliation
    pub fn finished(app: Arc<AppSpec>, result: Arc<ReconciliationResult>) -> Self {
        if result.succeeded() {
            Self::Succeeded { app, result }
        } else {
            Self::Failed { app, result }
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    /// The application this event is about
    pub fn app(&self) -> &AppSpec {
        match self {
            Self::Started { app } | Self::Succeeded { app, .. } | Self::Failed { app, .. } => app,
        }
    }

    /// The final result, for finished events
    pub fn result(&self) -> Option<&ReconciliationResult> {
        match self {
            Self::Started { .. } => None,
            Self::Succeeded { result, .. } | Self::Failed { result, .. } => Some(result),
        }
    }
}

/// Receives lifecycle events
#[async_trait]
pub trait LifecycleSubscriber: Send + Sync {
    /// Name used when logging delivery failures
    fn name(&self) -> &str;

    /// Handle one event. Errors are logged by the bus.
    async fn on_event(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Fixed set of subscribers, chosen at wiring time
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn LifecycleSubscriber>>,
}

/// Builder for [`EventBus`]
#[derive(Default)]
pub struct EventBusBuilder {
    subscribers: Vec<Arc<dyn LifecycleSubscriber>>,
}

impl EventBusBuilder {
    /// Append a subscriber; delivery follows this order
    pub fn subscribe(mut self, subscriber: Arc<dyn LifecycleSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Finish wiring
    pub fn build(self) -> EventBus {
        EventBus {
            subscribers: self.subscribers,
        }
    }
}

impl EventBus {
    /// Start wiring a bus
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `event` to every subscriber in order, returning once all have
    /// been invoked
    pub async fn publish(&self, event: &LifecycleEvent) {
        for subscriber in &self.subscribers {
            let delivery = AssertUnwindSafe(subscriber.on_event(event))
                .catch_unwind()
                .await;
            match delivery {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subscriber = %subscriber.name(),
                    event = event.name(),
                    app = %event.app().name,
                    error = %e,
                    "Lifecycle subscriber failed"
                ),
                Err(_) => error!(
                    subscriber = %subscriber.name(),
                    event = event.name(),
                    app = %event.app().name,
                    "Lifecycle subscriber panicked"
                ),
            }
        }
    }
}
