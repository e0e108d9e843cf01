#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    cluster::{ClusterApi, KubeHttpClient},
    config::Config,
    dashboard::Dashboard,
    gc::GarbageCollector,
    prober::HttpReadinessProbe,
    provisioner::{WorkloadImages, WorkloadProvisioner},
    quota::QuotaTracker,
    registry::SessionRegistry,
    resolver::{ArchiveResolver, ResolverSettings},
    rollout::RolloutMonitor,
    server::{AppState, build_router},
    session::{SessionComponents, SessionController},
    shutdown::Shutdown,
    teardown::Teardown,
};

pub mod app_label;
pub mod cluster;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gc;
pub mod prober;
pub mod provisioner;
pub mod quota;
pub mod registry;
pub mod resolver;
pub mod rollout;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod teardown;

/// HTTP state plus the background workers started alongside it.
pub struct ServiceState {
    pub app: AppState,
    pub quota: Arc<QuotaTracker>,
    pub collector: Arc<GarbageCollector>,
}

pub fn build_state(config: &Config, shutdown: Shutdown) -> Result<ServiceState> {
    let cluster = KubeHttpClient::new(
        config.cluster_api_url.as_str(),
        config.namespace.as_str(),
        config.cluster_token.clone(),
        config.cluster_token_path.as_path(),
        config.cluster_ca_path.as_path(),
    )?;
    build_state_with_cluster(config, Arc::new(cluster), shutdown)
}

pub fn build_state_with_cluster(
    config: &Config,
    cluster: Arc<dyn ClusterApi>,
    shutdown: Shutdown,
) -> Result<ServiceState> {
    let registry = Arc::new(SessionRegistry::new());
    let dashboard = Dashboard::from_config(config.dashboard.clone(), config.fetch_timeout());
    let teardown = Teardown::new(cluster.clone(), dashboard.clone());
    let quota = Arc::new(QuotaTracker::new(
        cluster.clone(),
        registry.clone(),
        config.quota_name.as_str(),
        std::time::Duration::from_millis(config.quota_reconnect_base_ms),
        std::time::Duration::from_millis(config.quota_reconnect_max_ms),
    ));
    let collector = Arc::new(GarbageCollector::new(
        cluster.clone(),
        teardown.clone(),
        config.workload_ttl(),
        config.gc_interval(),
    ));

    let controller = Arc::new(SessionController::new(SessionComponents {
        locator: Arc::new(ArchiveResolver::new(ResolverSettings::with_timeout(
            config.fetch_timeout(),
        ))),
        provisioner: WorkloadProvisioner::new(
            cluster.clone(),
            WorkloadImages {
                fetcher: config.fetcher_image.clone(),
                prometheus: config.prometheus_image.clone(),
            },
        ),
        rollout: RolloutMonitor::new(cluster, config.rollout_timeout()),
        probe: Arc::new(HttpReadinessProbe::new(
            config.probe_interval(),
            config.probe_timeout(),
        )?),
        dashboard,
        teardown,
        quota: quota.clone(),
        registry,
        shutdown,
    }));

    Ok(ServiceState {
        app: AppState::new(config.service_name.clone(), controller),
        quota,
        collector,
    })
}

pub fn build_app(config: &Config, shutdown: Shutdown) -> Result<axum::Router> {
    Ok(build_router(build_state(config, shutdown)?.app))
}

/// Runs the service until `shutdown` fires: quota tracker, garbage collector
/// and the HTTP listener, which drains in-flight requests before returning.
pub async fn serve(config: Config, shutdown: Shutdown) -> Result<()> {
    let state = build_state(&config, shutdown.clone())?;
    if let Err(error) = state.quota.initialize().await {
        warn!(quota = %config.quota_name, reason = %error, code = error.code(), "initial quota read failed");
    }
    let quota_task = tokio::spawn(state.quota.clone().run(shutdown.clone()));
    let gc_task = tokio::spawn(state.collector.clone().run(shutdown.clone()));

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        namespace = %config.namespace,
        "sandbox service listening"
    );
    let drain = shutdown.clone();
    axum::serve(
        listener,
        build_router(state.app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain.cancelled().await })
    .await?;

    let _ = tokio::join!(quota_task, gc_task);
    info!(service = %config.service_name, "sandbox service stopped");
    Ok(())
}
