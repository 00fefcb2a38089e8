//! fiaas deploy daemon - deploys fiaas applications to Kubernetes

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::{Api, Client};
use tracing::{info, warn};

use fiaas_common::crd::{
    Application, ApplicationResource, ApplicationStatus, PaasbetaApplication, PaasbetaStatus,
    SpecSource, StatusResource,
};
use fiaas_common::events::KubeEventPublisher;
use fiaas_common::kube_utils::create_client;
use fiaas_common::telemetry::{init_telemetry, TelemetryConfig};
use fiaas_common::CONTROLLER_NAME;
use fiaas_deployer::{
    CallbackRegistry, EventBus, EventRecorder, HttpNotificationSender, KubeClusterClient,
    KubeStatusStore, Reconciler, Reporter, StatusTracker,
};
use fiaas_operator::{startup, watch, Cli, Dispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", startup::crd_manifests()?);
        return Ok(());
    }

    init_telemetry(
        TelemetryConfig::default()
            .with_attribute("fiaas.environment", cli.environment.clone())
            .with_attribute("fiaas.infrastructure", cli.infrastructure.clone()),
    )?;

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let source = startup::detect_spec_source(&client, cli.forced_spec_source()).await?;
    if source == SpecSource::Modern {
        startup::ensure_crds_installed(&client).await?;
    }

    match source {
        SpecSource::Modern => run::<Application, ApplicationStatus>(client, cli).await,
        SpecSource::Legacy => run::<PaasbetaApplication, PaasbetaStatus>(client, cli).await,
    }
}

async fn run<A, S>(client: Client, cli: Cli) -> anyhow::Result<()>
where
    A: ApplicationResource,
    S: StatusResource,
{
    let reporter_config = cli.reporter_config();
    let sender = HttpNotificationSender::new(reporter_config.timeout)?;
    let callbacks = Arc::new(CallbackRegistry::new());
    let reporter = Reporter::new(callbacks.clone(), Arc::new(sender), reporter_config);
    let bus = EventBus::builder()
        .subscribe(Arc::new(StatusTracker::new(Arc::new(
            KubeStatusStore::<S>::new(client.clone()),
        ))))
        .subscribe(Arc::new(reporter.spawn()))
        .subscribe(Arc::new(EventRecorder::new(
            Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)),
            A::SOURCE,
        )))
        .build();

    let reconciler = Reconciler::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        bus,
        cli.deployer_config(),
    );
    let dispatcher =
        Dispatcher::with_callbacks(Arc::new(reconciler), cli.dispatcher_config(), callbacks);

    let api: Api<A> = Api::namespaced(client, &cli.namespace);
    let changes = watch::application_changes(api);
    tokio::pin!(changes);
    let source = A::SOURCE;
    info!(namespace = %cli.namespace, source = %source, "Watching application resources");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            next = changes.next() => match next {
                Some(Ok(change)) => {
                    let app = change.name.clone();
                    if let Err(e) = dispatcher.dispatch(change) {
                        warn!(app = %app, error = %e, "Rejected application change");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Application watch failed, retrying"),
                None => break,
            }
        }
    }
    Ok(())
}
