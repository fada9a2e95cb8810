//! Multidimensional Pod Autoscaler
//!
//! One binary for the three components. Each runs as its own Deployment:
//! `mpa recommender`, `mpa updater` or `mpa admission-controller`.

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use mpa_lib::{
    admission::{create_router, load_tls_config, serve_tls, AdmissionState, PodHandler, RecommendationProvider},
    client::kube_impl::{ControllerCache, KubeCluster},
    health::{loops, HealthRegistry},
    lease::LeaseRefresher,
    observability::{MpaMetrics, StructuredLogger},
    policy::{CappingProcessor, LimitRangeCalculator},
    recommender::Recommender,
    target::{ControllerFetcher, MpaMatcher},
    updater::Updater,
    FeatureGates,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{Cli, Component, MpaConfig};

const MPA_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let mut config = MpaConfig::load()?;
    cli.apply(&mut config);
    let features = config.features()?;

    let component = cli.command.name();
    let logger = StructuredLogger::new(component);
    logger.log_startup(MPA_VERSION);
    info!(
        component,
        namespace = config.mpa_object_namespace.as_deref().unwrap_or("<all>"),
        feature_gates = %features,
        kube_api_qps = config.kube_api_qps,
        kube_api_burst = config.kube_api_burst,
        "MPA configured"
    );

    let client = kube_client(&config).await?;
    let health_registry = HealthRegistry::new();
    let metrics = MpaMetrics::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(
        config.address.clone(),
        app_state,
        shutdown_tx.subscribe(),
    ));

    let handles = match &cli.command {
        Component::Recommender(_) => {
            start_recommender(&config, client, &health_registry, &shutdown_tx).await?
        }
        Component::Updater(_) => {
            start_updater(&config, features, client, &health_registry, &shutdown_tx).await?
        }
        Component::AdmissionController(_) => {
            start_admission_controller(
                &config,
                features,
                client,
                &health_registry,
                metrics,
                &shutdown_tx,
            )
            .await?
        }
    };

    // Mark ready once the component loops are running
    health_registry.set_ready(true).await;

    shutdown_signal().await?;
    logger.log_shutdown("termination signal received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Component task failed");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }
    info!("Shutting down");

    Ok(())
}

async fn kube_client(config: &MpaConfig) -> Result<Client> {
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?,
    };
    Client::try_from(kube_config).context("failed to create Kubernetes client")
}

/// Controller lookups backed by informer caches, once they have synced
async fn fetcher(client: &Client, cluster: &Arc<KubeCluster>) -> Result<ControllerFetcher> {
    let cache = ControllerCache::start(client.clone());
    cache
        .wait_until_ready()
        .await
        .context("controller caches did not sync")?;
    info!("Controller caches synced");
    Ok(ControllerFetcher::new(Arc::new(cache), cluster.clone()))
}

async fn start_recommender(
    config: &MpaConfig,
    client: Client,
    health: &HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let cluster = Arc::new(KubeCluster::new(client.clone(), "mpa-recommender"));
    let recommender = Recommender::new(
        config.recommender_config(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        fetcher(&client, &cluster).await?,
    )
    .context("failed to create recommender")?;

    Ok(vec![tokio::spawn(
        recommender.run(health.clone(), shutdown.subscribe()),
    )])
}

async fn start_updater(
    config: &MpaConfig,
    features: FeatureGates,
    client: Client,
    health: &HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let cluster = Arc::new(KubeCluster::new(client.clone(), "mpa-updater"));
    let updater = Updater::new(
        config.updater_config(features),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        fetcher(&client, &cluster).await?,
    );

    Ok(vec![tokio::spawn(updater.run(health.clone(), shutdown.subscribe()))])
}

async fn start_admission_controller(
    config: &MpaConfig,
    features: FeatureGates,
    client: Client,
    health: &HealthRegistry,
    metrics: MpaMetrics,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let settings = &config.admission;
    let cluster = Arc::new(KubeCluster::new(client.clone(), "mpa-admission-controller"));
    let capping = CappingProcessor::new(LimitRangeCalculator::new(cluster.clone()));
    let handler = PodHandler::new(
        MpaMatcher::new(cluster.clone(), fetcher(&client, &cluster).await?),
        RecommendationProvider::new(capping),
        features,
    );
    let state = AdmissionState {
        pods: Arc::new(handler),
        features,
        metrics,
        logger: StructuredLogger::new("admission-controller"),
    };

    let tls = load_tls_config(
        &settings.cert_file,
        &settings.key_file,
        settings.client_ca_file.as_deref(),
    )
    .context("failed to load webhook TLS configuration")?;
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.webhook_port));

    let webhook_health = health.clone();
    let webhook_shutdown = shutdown.subscribe();
    let webhook = tokio::spawn(async move {
        webhook_health.register(loops::ADMISSION_CONTROLLER).await;
        if let Err(e) = serve_tls(addr, create_router(state), tls, webhook_shutdown).await {
            error!(error = %e, "Admission webhook failed");
            webhook_health
                .set_unhealthy(loops::ADMISSION_CONTROLLER, e.to_string())
                .await;
        }
    });

    let holder = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "mpa-admission-controller".to_string());
    let lease = LeaseRefresher::new(cluster, config.lease_namespace.clone(), holder);
    let lease_handle = tokio::spawn(lease.run(health.clone(), shutdown.subscribe()));

    Ok(vec![webhook, lease_handle])
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
