//! Identity metadata binding an application's derived objects together

use std::collections::BTreeMap;

use fiaas_common::kube_utils::label_value;
use fiaas_common::{APP_LABEL, DEPLOYED_BY_LABEL, DEPLOYMENT_ID_LABEL, VERSION_LABEL};
use fiaas_spec::AppSpec;

/// Labels stamped on every derived object and the selector shared by them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityMetadata {
    /// Full identity label set
    pub labels: BTreeMap<String, String>,
    /// `{app: name}`; stable for the lifetime of the application
    pub selector: BTreeMap<String, String>,
}

impl IdentityMetadata {
    /// Compute identity metadata for one reconciliation of `app`
    pub fn for_app(app: &AppSpec, controller_version: &str) -> Self {
        let selector = BTreeMap::from([(APP_LABEL.to_string(), app.name.clone())]);
        let mut labels = selector.clone();
        labels.insert(VERSION_LABEL.to_string(), label_value(&app.version));
        labels.insert(
            DEPLOYED_BY_LABEL.to_string(),
            label_value(controller_version),
        );
        labels.insert(
            DEPLOYMENT_ID_LABEL.to_string(),
            label_value(&app.deployment_id),
        );
        Self { labels, selector }
    }

    /// User labels overlaid with the identity labels; identity keys win
    pub fn labels_with(&self, user: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels = user.clone();
        labels.extend(self.labels.clone());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiaas_spec::{normalize, RawSpecDocument};

    fn app(image: &str, deployment_id: &str) -> AppSpec {
        normalize(&RawSpecDocument::new(
            "web",
            "default",
            image,
            deployment_id,
            serde_json::json!({"version": 3}),
        ))
        .unwrap()
    }

    /// Story: the selector is the app label alone and survives redeploys
    #[test]
    fn story_selector_is_stable_and_narrower() {
        let first = IdentityMetadata::for_app(&app("web:1", "d1"), "1.0");
        let second = IdentityMetadata::for_app(&app("web:2", "d2"), "1.0");

        assert_eq!(
            first.selector,
            BTreeMap::from([("app".to_string(), "web".to_string())])
        );
        assert_eq!(first.selector, second.selector);
        for (key, value) in &first.selector {
            assert_eq!(first.labels.get(key), Some(value));
        }
        assert!(first.labels.len() > first.selector.len());

        assert_eq!(first.labels[VERSION_LABEL], "1");
        assert_eq!(second.labels[VERSION_LABEL], "2");
        assert_eq!(second.labels[DEPLOYMENT_ID_LABEL], "d2");
        assert_eq!(second.labels[DEPLOYED_BY_LABEL], "1.0");
    }

    #[test]
    fn user_labels_never_override_identity() {
        let identity = IdentityMetadata::for_app(&app("web:1", "d1"), "1.0");
        let user = BTreeMap::from([
            ("app".to_string(), "evil".to_string()),
            ("team".to_string(), "core".to_string()),
        ]);
        let labels = identity.labels_with(&user);
        assert_eq!(labels["app"], "web");
        assert_eq!(labels["team"], "core");
    }

    #[test]
    fn label_values_are_sanitized() {
        let identity = IdentityMetadata::for_app(&app("web@sha256:abc", "build/7"), "1.0");
        assert!(identity.labels[VERSION_LABEL].starts_with("sha256-abc"));
        assert!(identity.labels[DEPLOYMENT_ID_LABEL].starts_with("build-7"));
    }
}
