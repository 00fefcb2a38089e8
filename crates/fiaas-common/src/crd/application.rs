//! Application custom resources
//!
//! An application resource wraps a raw, versioned fiaas config document. The
//! deployment id correlating one deploy is carried as a label so that the
//! pipeline can set it together with the new spec in a single write.

use std::fmt;

use kube::{CustomResource, Resource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::{CALLBACK_URL_ANNOTATION, DEPLOYMENT_ID_LABEL};

/// Deployment id of resources carrying nothing to derive one from
pub const UNKNOWN_DEPLOYMENT_ID: &str = "unknown";

/// Which generation of custom resources submits application specs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecSource {
    /// Third-party-resource era kinds under `schibsted.io/v1beta`
    Legacy,
    /// Custom-resource-definition kinds under `fiaas.schibsted.io/v1`
    Modern,
}

impl SpecSource {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "tpr",
            Self::Modern => "crd",
        }
    }

    /// API group of both kinds of this flavor
    pub fn group(&self) -> &'static str {
        match self {
            Self::Legacy => "schibsted.io",
            Self::Modern => "fiaas.schibsted.io",
        }
    }

    /// API version of both kinds of this flavor
    pub fn version(&self) -> &'static str {
        match self {
            Self::Legacy => "v1beta",
            Self::Modern => "v1",
        }
    }

    /// Kind carrying the application spec
    pub fn application_kind(&self) -> &'static str {
        match self {
            Self::Legacy => "PaasbetaApplication",
            Self::Modern => "Application",
        }
    }

    /// Kind carrying per-deployment status records
    pub fn status_kind(&self) -> &'static str {
        match self {
            Self::Legacy => "PaasbetaStatus",
            Self::Modern => "ApplicationStatus",
        }
    }
}

impl fmt::Display for SpecSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Specification for an Application
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fiaas.schibsted.io",
    version = "v1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    shortname = "fa",
    namespaced,
    printcolumn = r#"{"name":"Application","type":"string","jsonPath":".spec.application"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ApplicationSpec {
    /// Application name; all derived objects carry this name
    pub application: String,
    /// Full container image reference
    pub image: String,
    /// Raw versioned fiaas config document
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: serde_json::Value,
}

/// Specification for a legacy PaasbetaApplication
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "schibsted.io",
    version = "v1beta",
    kind = "PaasbetaApplication",
    plural = "paasbetaapplications",
    namespaced
)]
pub struct PaasbetaApplicationSpec {
    /// Same payload as the modern flavor
    #[serde(flatten)]
    pub inner: ApplicationSpec,
}

/// Common view over both application flavors
pub trait ApplicationResource:
    Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Flavor this kind belongs to
    const SOURCE: SpecSource;

    /// The application payload
    fn application_spec(&self) -> &ApplicationSpec;

    /// Deployment id from the `fiaas/deployment_id` label
    ///
    /// Resources submitted without the label get an id derived from their
    /// resourceVersion, so every observed change still gets its own status.
    /// Objects that never went through the API server have neither; they
    /// fall back to their uid and, failing that, to a shared placeholder.
    fn deployment_id(&self) -> String {
        if let Some(id) = self.labels().get(DEPLOYMENT_ID_LABEL) {
            if !id.is_empty() {
                return id.clone();
            }
        }
        if let Some(rv) = self.resource_version() {
            return format!("rv-{}", rv);
        }
        if let Some(uid) = self.uid() {
            return format!("uid-{}", uid);
        }
        warn!(
            app = %self.application_spec().application,
            "Application resource has no deployment id, resourceVersion or uid"
        );
        UNKNOWN_DEPLOYMENT_ID.to_string()
    }

    /// Pipeline callback URL from the `fiaas/callback_url` annotation
    fn callback_url(&self) -> Option<String> {
        self.annotations()
            .get(CALLBACK_URL_ANNOTATION)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

impl ApplicationResource for Application {
    const SOURCE: SpecSource = SpecSource::Modern;

    fn application_spec(&self) -> &ApplicationSpec {
        &self.spec
    }
}

impl ApplicationResource for PaasbetaApplication {
    const SOURCE: SpecSource = SpecSource::Legacy;

    fn application_spec(&self) -> &ApplicationSpec {
        &self.spec.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use kube::CustomResourceExt;
    use std::collections::BTreeMap;

    fn sample_spec() -> ApplicationSpec {
        ApplicationSpec {
            application: "web".to_string(),
            image: "registry/web:1.2".to_string(),
            config: serde_json::json!({"version": 3}),
        }
    }

    #[test]
    fn deployment_id_comes_from_label() {
        let mut app = Application::new("web", sample_spec());
        app.metadata.labels = Some(BTreeMap::from([(
            DEPLOYMENT_ID_LABEL.to_string(),
            "d1".to_string(),
        )]));
        assert_eq!(app.deployment_id(), "d1");
    }

    #[test]
    fn deployment_id_falls_back_to_resource_version() {
        let app = PaasbetaApplication {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: PaasbetaApplicationSpec {
                inner: sample_spec(),
            },
        };
        assert_eq!(app.deployment_id(), "rv-42");
        assert_eq!(app.application_spec().application, "web");
    }

    #[test]
    fn deployment_id_without_label_or_version_uses_uid() {
        let mut app = Application::new("web", sample_spec());
        app.metadata.uid = Some("5f1c".to_string());
        assert_eq!(app.deployment_id(), "uid-5f1c");

        app.metadata.uid = None;
        assert_eq!(app.deployment_id(), UNKNOWN_DEPLOYMENT_ID);
    }

    #[test]
    fn callback_url_comes_from_annotation() {
        let mut app = Application::new("web", sample_spec());
        assert_eq!(app.callback_url(), None);

        app.metadata.annotations = Some(BTreeMap::from([(
            CALLBACK_URL_ANNOTATION.to_string(),
            " http://pipeline.example/cb ".to_string(),
        )]));
        assert_eq!(app.callback_url().as_deref(), Some("http://pipeline.example/cb"));

        app.metadata.annotations = Some(BTreeMap::from([(
            CALLBACK_URL_ANNOTATION.to_string(),
            String::new(),
        )]));
        assert_eq!(app.callback_url(), None);
    }

    #[test]
    fn legacy_payload_is_flat() {
        let spec = PaasbetaApplicationSpec {
            inner: sample_spec(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["application"], "web");
        assert_eq!(json["config"]["version"], 3);
    }

    #[test]
    fn config_schema_preserves_unknown_fields() {
        let crd = Application::crd();
        let json = serde_json::to_value(&crd).unwrap();
        let config = &json["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["spec"]["properties"]["config"];
        assert_eq!(config["x-kubernetes-preserve-unknown-fields"], true);
        assert_eq!(crd.spec.group, SpecSource::Modern.group());
    }

    #[test]
    fn sources_name_their_kinds() {
        assert_eq!(SpecSource::Modern.application_kind(), "Application");
        assert_eq!(SpecSource::Legacy.status_kind(), "PaasbetaStatus");
        assert_eq!(<Application as ApplicationResource>::SOURCE, SpecSource::Modern);
        assert_eq!(
            <PaasbetaApplication as ApplicationResource>::SOURCE,
            SpecSource::Legacy
        );
    }
}
