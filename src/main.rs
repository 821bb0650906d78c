//! Ghost Operator - runs one Ghost blog per Ghost resource

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ghost_operator::config::ControllerConfig;
use ghost_operator::controller::{error_policy, reconcile, Context};
use ghost_operator::crd::Ghost;
use ghost_operator::desired::DesiredStateGenerator;
use ghost_operator::events::KubeEventPublisher;
use ghost_operator::manifests::{DirManifests, EmbeddedManifests, ManifestSource, Templates};
use ghost_operator::retry::{retry_with_backoff, RetryConfig};
use ghost_operator::store::{GuardedStore, KubeStore};

/// Ghost Operator - CRD-driven Kubernetes operator for Ghost blogs
#[derive(Parser, Debug)]
#[command(name = "ghost-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, env = "GHOST_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    controller: ControllerConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    if cli.crd {
        let crd = serde_yaml::to_string(&Ghost::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli.controller).await
}

/// Install or update the Ghost CRD
///
/// The operator applies its own CRD on startup using server-side apply so the
/// schema always matches the running version.
async fn ensure_crd_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = Ghost::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();
    let patch = Patch::Apply(&crd);

    tracing::info!(crd = %name, "Installing Ghost CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "install Ghost CRD",
        |e: &kube::Error| !matches!(e, kube::Error::Api(ae) if ae.code == 422 || ae.code == 403),
        || crds.patch(&name, &params, &patch),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Ghost CRD: {}", e))?;

    tracing::info!("Ghost CRD installed/updated");
    Ok(())
}

/// Load templates from the override directory, or the built-in set
fn load_templates(config: &ControllerConfig) -> anyhow::Result<Templates> {
    let source: Box<dyn ManifestSource> = match &config.manifest_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Loading templates from directory");
            Box::new(DirManifests::new(dir))
        }
        None => Box::new(EmbeddedManifests),
    };
    Templates::load(source.as_ref()).map_err(|e| anyhow::anyhow!("{}", e))
}

/// Run the Ghost controller until a shutdown signal arrives
async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let templates = load_templates(&config)?;
    let generator = Arc::new(DesiredStateGenerator::new(
        Arc::new(templates),
        config.generator_options(),
    ));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client, &config.controller_name).await?;

    let cancel = CancellationToken::new();
    let store = Arc::new(GuardedStore::new(
        Arc::new(KubeStore::new(client.clone(), &config.controller_name)),
        config.api_timeout(),
        cancel.clone(),
    ));
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        &config.controller_name,
    ));

    let (ghosts, pvcs, deployments, services) = match &config.namespace {
        Some(ns) => (
            Api::<Ghost>::namespaced(client.clone(), ns),
            Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns),
            Api::<Deployment>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<Ghost>::all(client.clone()),
            Api::<PersistentVolumeClaim>::all(client.clone()),
            Api::<Deployment>::all(client.clone()),
            Api::<Service>::all(client.clone()),
        ),
    };

    let runtime_config = ControllerRuntimeConfig::default().concurrency(config.concurrency);
    let ctx = Arc::new(
        Context::builder(store, generator)
            .events(events)
            .config(config.clone())
            .build(),
    );

    tracing::info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        concurrency = config.concurrency,
        "Starting Ghost controller"
    );

    let shutdown = cancel.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, cancelling in-flight calls");
        shutdown.cancel();
    });

    let controller = Controller::new(ghosts, WatcherConfig::default())
        .owns(pvcs, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .with_config(runtime_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(ghost = %obj, ?action, "Ghost reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Ghost reconciliation error");
                }
            }
        });

    controller.await;
    cancel.cancel();
    signal_task.abort();

    tracing::info!("Ghost operator shut down");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
