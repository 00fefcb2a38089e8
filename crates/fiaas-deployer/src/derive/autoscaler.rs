//! Autoscaler deriver

use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};

use fiaas_spec::AppSpec;

use super::{int, object_meta, Derived, Deriver};
use crate::identity::IdentityMetadata;
use crate::object::{ManagedObject, ObjectKind};

/// Builds the application's HorizontalPodAutoscaler, scaling its Deployment.
/// Not applicable when the replica bounds are equal.
pub struct AutoscalerDeriver;

impl Deriver for AutoscalerDeriver {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Autoscaler
    }

    fn derive(&self, app: &AppSpec, identity: &IdentityMetadata) -> Derived {
        let Some(autoscaler) = app.autoscaler else {
            return Derived::NotApplicable;
        };
        Derived::Object(ManagedObject::Autoscaler(HorizontalPodAutoscaler {
            metadata: object_meta(
                ObjectKind::Autoscaler,
                app,
                identity.labels_with(&app.labels.horizontal_pod_autoscaler),
                &app.annotations.horizontal_pod_autoscaler,
            ),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: ObjectKind::Deployment.as_str().to_string(),
                    name: ObjectKind::Deployment.object_name(&app.name),
                },
                min_replicas: Some(int(autoscaler.min_replicas)),
                max_replicas: int(autoscaler.max_replicas),
                target_cpu_utilization_percentage: Some(int(autoscaler.cpu_threshold_percentage)),
            }),
            status: None,
        }))
    }
}
