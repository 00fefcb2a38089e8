//! Startup: CRD installation and spec source detection

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::discovery::Discovery;
use kube::{Client, CustomResourceExt};
use tracing::info;

use fiaas_common::crd::{Application, ApplicationStatus, PaasbetaApplication, PaasbetaStatus, SpecSource};
use fiaas_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn modern_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "applications.fiaas.schibsted.io",
            crd: Application::crd(),
        },
        CrdDef {
            name: "application-statuses.fiaas.schibsted.io",
            crd: ApplicationStatus::crd(),
        },
    ]
}

/// YAML of every CRD the daemon understands, as printed by `--crd`
pub fn crd_manifests() -> anyhow::Result<String> {
    let crds = [
        Application::crd(),
        ApplicationStatus::crd(),
        PaasbetaApplication::crd(),
        PaasbetaStatus::crd(),
    ];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

/// Install the `fiaas.schibsted.io` CRDs using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in modern_crds() {
        info!(crd = def.name, "Installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }
    Ok(())
}

/// Pick the spec source from the support flags, falling back to the API
/// groups the cluster serves. The modern flavor wins when both are served
/// and is the default when neither is.
pub fn select_spec_source(
    forced: Option<SpecSource>,
    has_group: impl Fn(&str) -> bool,
) -> SpecSource {
    if let Some(source) = forced {
        return source;
    }
    if has_group(SpecSource::Modern.group()) {
        SpecSource::Modern
    } else if has_group(SpecSource::Legacy.group()) {
        SpecSource::Legacy
    } else {
        SpecSource::Modern
    }
}

/// Resolve the spec source, querying API discovery only when no flag forces
/// one
pub async fn detect_spec_source(
    client: &Client,
    forced: Option<SpecSource>,
) -> anyhow::Result<SpecSource> {
    if let Some(source) = forced {
        info!(source = %source, "Spec source set by flag");
        return Ok(source);
    }
    let discovery = Discovery::new(client.clone())
        .filter(&[SpecSource::Modern.group(), SpecSource::Legacy.group()])
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("API discovery failed: {}", e))?;
    let source = select_spec_source(None, |group| discovery.has_group(group));
    info!(source = %source, "Detected spec source");
    Ok(source)
}
