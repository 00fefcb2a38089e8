//! Reconciliation engine for the fiaas deploy controller
//!
//! Turns a canonical [`fiaas_spec::AppSpec`] into live Deployment, Service,
//! Ingress and autoscaler objects:
//!
//! - [`derive`]: pure derivation of desired objects
//! - [`apply`]: create-or-update with conflict retry
//! - [`reconciler`]: one reconciliation attempt, aggregated into a result
//! - [`bus`]: lifecycle events to decoupled subscribers
//! - [`status`], [`reporter`], [`recorder`]: the subscribers

#![deny(missing_docs)]

pub mod apply;
pub mod bus;
pub mod cluster;
pub mod derive;
pub mod identity;
pub mod object;
pub mod reconciler;
pub mod recorder;
pub mod reporter;
pub mod result;
pub mod status;

pub use bus::{EventBus, LifecycleEvent, LifecycleSubscriber};
pub use cluster::{ClusterClient, KubeClusterClient};
pub use derive::{DeriverConfig, ServiceType};
pub use identity::IdentityMetadata;
pub use object::{ManagedObject, ObjectKind};
pub use reconciler::{DeployerConfig, Reconciler};
pub use recorder::EventRecorder;
pub use reporter::{
    CallbackRegistry, HttpNotificationSender, NotificationSender, Reporter, ReporterConfig,
    ReporterHandle,
};
pub use result::{ObjectOutcome, ObjectResult, ReconciliationResult};
pub use status::{InMemoryStatusStore, KubeStatusStore, StatusStore, StatusTracker};
