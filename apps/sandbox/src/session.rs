//! Per-connection command handling: create and delete pipelines plus quota
//! registration.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Url;
use sandbox_protocol::{Action, ClientAction, ClientMessage, StatusEvent};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app_label::AppLabel;
use crate::dashboard::Dashboard;
use crate::error::PipelineError;
use crate::prober::ReadinessProbe;
use crate::provisioner::WorkloadProvisioner;
use crate::quota::QuotaTracker;
use crate::registry::{EventSink, SessionRegistry};
use crate::resolver::{ArchiveInfo, ArchiveLocator};
use crate::rollout::RolloutMonitor;
use crate::shutdown::Shutdown;
use crate::teardown::Teardown;

const QUERY_END_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Everything a controller drives. Built once at startup and shared by every
/// connection.
pub struct SessionComponents {
    pub locator: Arc<dyn ArchiveLocator>,
    pub provisioner: WorkloadProvisioner,
    pub rollout: RolloutMonitor,
    pub probe: Arc<dyn ReadinessProbe>,
    pub dashboard: Dashboard,
    pub teardown: Teardown,
    pub quota: Arc<QuotaTracker>,
    pub registry: Arc<SessionRegistry>,
    pub shutdown: Shutdown,
}

pub struct SessionController {
    components: SessionComponents,
}

impl SessionController {
    pub fn new(components: SessionComponents) -> Self {
        Self { components }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.components.registry
    }

    /// Handles one inbound frame. `new` and `delete` run as detached tasks so
    /// the read loop keeps serving the connection; their handles are returned.
    pub async fn handle_command(
        self: &Arc<Self>,
        peer: SocketAddr,
        message: ClientMessage,
        sink: &EventSink,
    ) -> Option<JoinHandle<()>> {
        let Some(action) = message.client_action() else {
            warn!(peer = %peer, action = %message.action, "ignoring unknown action");
            return None;
        };
        match action {
            ClientAction::Connect => {
                self.components.registry.add(peer, sink.clone()).await;
                let snapshot = self.components.quota.snapshot().await;
                let _ = sink.send(StatusEvent::quota(snapshot));
                info!(peer = %peer, "observer connected");
                None
            }
            ClientAction::New => {
                let controller = Arc::clone(self);
                let sink = sink.clone();
                Some(tokio::spawn(async move {
                    controller.create(message.message.as_str(), &sink).await;
                }))
            }
            ClientAction::Delete => {
                let controller = Arc::clone(self);
                let sink = sink.clone();
                Some(tokio::spawn(async move {
                    controller.delete(message.message.as_str(), &sink).await;
                }))
            }
        }
    }

    /// Runs the full create pipeline for `run_url`, reporting every stage to
    /// `sink`. Ends with `done` once the sandbox serves queries, or with the
    /// `error` or `failure` that aborted it.
    pub async fn create(&self, run_url: &str, sink: &EventSink) -> AppLabel {
        let issuer = self.components.teardown.issuer();
        let label = issuer.issue();
        let _ = sink.emit(Action::AppLabel, label.as_str());
        info!(app_label = %label, run_url = %run_url, "create requested");
        match self.run_create(&label, run_url, sink).await {
            Ok(()) => {
                let _ = sink.emit(Action::Done, "Pod is ready");
                info!(app_label = %label, "sandbox ready");
            }
            Err(error) => {
                // Nothing was provisioned, so no teardown will ever free it.
                if matches!(error, PipelineError::Resolve(_)) {
                    issuer.release(&label);
                }
                report(&label, &error, sink);
            }
        }
        label
    }

    async fn run_create(&self, label: &AppLabel, run_url: &str, sink: &EventSink) -> Result<(), PipelineError> {
        let components = &self.components;
        let archive = components.locator.locate(run_url, sink).await?;

        let _ = sink.status("Deploying a new prometheus instance");
        let route = components
            .provisioner
            .provision(label, archive.archive_url.as_str())
            .await?;
        let _ = sink.send(link_event(route.as_str(), &archive));

        let _ = sink.progress("Waiting for pods to be created");
        components
            .rollout
            .monitor(label, sink, &components.shutdown)
            .await?;
        components
            .probe
            .wait_ready(route.as_str(), &components.shutdown)
            .await?;

        // The sandbox already serves queries; a dashboard failure is reported
        // without aborting.
        match components.dashboard.register(label, route.as_str()).await {
            Ok(Some(_)) => {
                let _ = sink.status(format!(
                    "Added {label} datasource at {}",
                    components.dashboard.base_url().unwrap_or_default()
                ));
            }
            Ok(None) => {}
            Err(error) => report(label, &PipelineError::from(error), sink),
        }
        Ok(())
    }

    /// Removes every resource of the sandbox named by `raw_label`.
    pub async fn delete(&self, raw_label: &str, sink: &EventSink) {
        let label = match AppLabel::parse(raw_label) {
            Ok(label) => label,
            Err(error) => {
                let error = PipelineError::from(error);
                warn!(raw_label = %raw_label, reason = %error, "rejected delete");
                let _ = sink.emit(error.action(), error.observer_message());
                return;
            }
        };
        let _ = sink.status(format!("Removing app {label}"));
        match self.components.teardown.remove(&label).await {
            Ok(report) => {
                info!(app_label = %label, removed = %report.log(), "delete finished");
                let _ = sink.emit(Action::Done, "Prometheus instance removed");
            }
            Err(error) => report(&label, &PipelineError::from(error), sink),
        }
    }
}

fn report(label: &AppLabel, error: &PipelineError, sink: &EventSink) {
    warn!(app_label = %label, reason = %error, code = error.code(), "pipeline failed");
    let _ = sink.emit(error.action(), error.observer_message());
}

/// Link to the sandbox's graph page with the query window pre-filled to the
/// run's time bounds.
pub fn link_event(route: &str, archive: &ArchiveInfo) -> StatusEvent {
    let host = Url::parse(route)
        .ok()
        .and_then(|url| url.host_str().map(ToString::to_string))
        .unwrap_or_else(|| route.trim_start_matches("https://").to_string());
    StatusEvent::new(Action::Link, graph_link(route, archive))
        .with_data("host", host)
        .with_data("route", route)
}

pub fn graph_link(route: &str, archive: &ArchiveInfo) -> String {
    let base = format!("{}/graph", route.trim_end_matches('/'));
    let Ok(mut url) = Url::parse(base.as_str()) else {
        return base;
    };
    let range = archive.finished.signed_duration_since(archive.started);
    url.query_pairs_mut()
        .append_pair("g0.expr", "up")
        .append_pair("g0.end_input", end_input(archive.finished).as_str())
        .append_pair("g0.range_input", go_duration(range).as_str())
        .append_pair("g0.stacked", "0")
        .append_pair("g0.tab", "0");
    url.to_string()
}

fn end_input(finished: DateTime<Utc>) -> String {
    finished.format(QUERY_END_FORMAT).to_string()
}

/// Renders whole seconds the way the graph UI's range box accepts them,
/// e.g. `1h30m0s`, `45m10s`, `0s`.
pub fn go_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    let (hours, minutes, seconds) = (total / 3_600, (total % 3_600) / 60, total % 60);
    if hours > 0 {
        format!("{sign}{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{sign}{minutes}m{seconds}s")
    } else {
        format!("{sign}{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use axum::{Router, http::StatusCode, routing::post};
    use chrono::{DateTime, Utc};
    use sandbox_protocol::{Action, ClientMessage, StatusEvent};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{SessionComponents, SessionController, go_duration, graph_link};
    use crate::cluster::{InMemoryCluster, ResourceKind, RolloutBehavior};
    use crate::config::DashboardConfig;
    use crate::dashboard::Dashboard;
    use crate::prober::{ProbeError, ReadinessProbe};
    use crate::provisioner::{WorkloadImages, WorkloadProvisioner};
    use crate::quota::QuotaTracker;
    use crate::registry::{EventSink, SessionRegistry};
    use crate::resolver::{ArchiveInfo, ArchiveLocator, ResolveError};
    use crate::rollout::RolloutMonitor;
    use crate::shutdown::Shutdown;
    use crate::teardown::Teardown;

    const ARCHIVE: &str = "https://storage.example/bucket/run/metrics/prometheus.tar";

    struct StaticLocator;

    #[async_trait]
    impl ArchiveLocator for StaticLocator {
        async fn locate(&self, run_url: &str, sink: &EventSink) -> Result<ArchiveInfo, ResolveError> {
            if !run_url.ends_with("prometheus.tar") {
                return Err(ResolveError::NoLinks {
                    url: run_url.to_string(),
                });
            }
            let _ = sink.status(format!("Found prometheus archive at {run_url}"));
            let now = Utc::now();
            Ok(ArchiveInfo {
                started: now,
                finished: now,
                archive_url: run_url.to_string(),
            })
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn wait_ready(&self, _route_url: &str, _shutdown: &Shutdown) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn controller(cluster: Arc<InMemoryCluster>) -> Arc<SessionController> {
        controller_with(cluster, Duration::from_secs(2), Dashboard::disabled())
    }

    fn controller_with(
        cluster: Arc<InMemoryCluster>,
        rollout_timeout: Duration,
        dashboard: Dashboard,
    ) -> Arc<SessionController> {
        let registry = Arc::new(SessionRegistry::new());
        let quota = Arc::new(QuotaTracker::new(
            cluster.clone(),
            registry.clone(),
            "pod-quota",
            Duration::from_millis(5),
            Duration::from_millis(5),
        ));
        Arc::new(SessionController::new(SessionComponents {
            locator: Arc::new(StaticLocator),
            provisioner: WorkloadProvisioner::new(
                cluster.clone(),
                WorkloadImages {
                    fetcher: "fetcher:latest".to_string(),
                    prometheus: "prometheus:latest".to_string(),
                },
            ),
            rollout: RolloutMonitor::new(cluster.clone(), rollout_timeout),
            probe: Arc::new(AlwaysReady),
            dashboard: dashboard.clone(),
            teardown: Teardown::new(cluster, dashboard),
            quota,
            registry,
            shutdown: Shutdown::never(),
        }))
    }

    fn drain(events: &mut UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40_000))
    }

    #[tokio::test]
    async fn create_then_delete_emits_ordered_events() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        cluster.set_logs("ci-fetcher", &["prometheus/wal/00000001", ""]).await;
        let controller = controller(cluster.clone());
        let (sink, mut events) = EventSink::channel();

        let Some(task) = controller
            .handle_command(peer(), ClientMessage::new("new", ARCHIVE), &sink)
            .await
        else {
            bail!("new must run as a task");
        };
        task.await?;
        let created = drain(&mut events);
        let actions = created.iter().map(|event| event.action).collect::<Vec<_>>();
        assert_eq!(actions.first(), Some(&Action::AppLabel));
        assert_eq!(actions.last(), Some(&Action::Done));
        let label = created[0].message.clone();

        let link_at = actions.iter().position(|action| *action == Action::Link);
        let Some(link_at) = link_at else {
            bail!("no link event in {actions:?}");
        };
        let link = &created[link_at];
        let host = format!("{label}-sandboxes.apps.sandbox.test");
        assert!(link.message.contains(host.as_str()));
        assert_eq!(link.data.as_ref().and_then(|data| data.get("host")), Some(&host));
        assert!(link.message.contains("/graph?g0.expr=up&"));
        // The init step's empty line is not forwarded.
        let logs = created
            .iter()
            .filter(|event| event.action == Action::Log)
            .map(|event| event.message.as_str())
            .collect::<Vec<_>>();
        assert_eq!(logs, vec!["prometheus/wal/00000001"]);
        assert!(!actions.contains(&Action::Failure));

        let Some(task) = controller
            .handle_command(peer(), ClientMessage::new("delete", label.as_str()), &sink)
            .await
        else {
            bail!("delete must run as a task");
        };
        task.await?;
        let deleted = drain(&mut events);
        let actions = deleted.iter().map(|event| event.action).collect::<Vec<_>>();
        assert_eq!(actions, vec![Action::Status, Action::Done]);
        assert_eq!(deleted[0].message, format!("Removing app {label}"));
        assert_eq!(deleted[1].message, "Prometheus instance removed");
        assert!(cluster.names(ResourceKind::Route).await.is_empty());
        assert!(cluster.names(ResourceKind::Deployment).await.is_empty());
        assert_eq!(controller.components.teardown.issuer().live_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn dashboard_failure_is_reported_before_done() -> Result<()> {
        let app = Router::new().route(
            "/api/datasources",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database is locked") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move { axum::serve(listener, app).await });
        let dashboard = Dashboard::from_config(
            Some(DashboardConfig {
                base_url: format!("http://{addr}"),
                token: "dash-token".to_string(),
                cookie: "grafana_session=1".to_string(),
            }),
            Duration::from_secs(2),
        );
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        let controller = controller_with(cluster, Duration::from_secs(2), dashboard);
        let (sink, mut events) = EventSink::channel();

        let label = controller.create(ARCHIVE, &sink).await;
        server.abort();
        let emitted = drain(&mut events);
        let actions = emitted.iter().map(|event| event.action).collect::<Vec<_>>();
        let Some(link_at) = actions.iter().position(|action| *action == Action::Link) else {
            bail!("no link event in {actions:?}");
        };
        let tail = &actions[actions.len().saturating_sub(2)..];
        assert_eq!(tail, [Action::Failure, Action::Done]);
        assert!(link_at < actions.len() - 2);
        let failure = &emitted[emitted.len() - 2];
        assert!(failure.message.starts_with("Failed to add dashboard data source"));
        assert_eq!(emitted[emitted.len() - 1].message, "Pod is ready");
        // The sandbox is live, so its label stays held until teardown.
        assert_eq!(controller.components.teardown.issuer().live_count(), 1);
        assert_eq!(label.as_str(), emitted[0].message);
        Ok(())
    }

    #[tokio::test]
    async fn stuck_init_step_is_reported_as_error() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        cluster.set_rollout(RolloutBehavior::InitStuck).await;
        cluster
            .set_logs("ci-fetcher", &["curl: (22) The requested URL returned error: 404"])
            .await;
        let controller = controller_with(cluster, Duration::from_millis(100), Dashboard::disabled());
        let (sink, mut events) = EventSink::channel();

        let _ = controller.create(ARCHIVE, &sink).await;
        let emitted = drain(&mut events);
        let Some(last) = emitted.last() else {
            bail!("no events emitted");
        };
        assert_eq!(last.action, Action::Error);
        assert!(last.message.contains("returned error: 404"));
        assert!(!emitted.iter().any(|event| event.action == Action::Done));
        Ok(())
    }

    #[tokio::test]
    async fn resolution_failure_is_reported_after_label() -> Result<()> {
        let controller = controller(Arc::new(InMemoryCluster::new("sandboxes")));
        let (sink, mut events) = EventSink::channel();

        let _ = controller.create("https://prow.example/view/job/1", &sink).await;
        let emitted = drain(&mut events);
        let actions = emitted.iter().map(|event| event.action).collect::<Vec<_>>();
        assert_eq!(actions, vec![Action::AppLabel, Action::Failure]);
        assert!(emitted[1].message.starts_with("Failed to find metrics archive"));
        assert_eq!(controller.components.teardown.issuer().live_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_delete_label_never_touches_cluster() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        cluster
            .upsert(
                ResourceKind::Service,
                json!({"metadata": {"name": "keep", "labels": {"app": "keep"}}}),
            )
            .await?;
        let controller = controller(cluster.clone());
        let (sink, mut events) = EventSink::channel();

        controller.delete("app=keep,x", &sink).await;
        let emitted = drain(&mut events);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].action, Action::Failure);
        assert_eq!(cluster.names(ResourceKind::Service).await, vec!["keep"]);
        Ok(())
    }

    #[tokio::test]
    async fn connect_registers_and_sends_quota() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        let controller = controller(cluster);
        let (sink, mut events) = EventSink::channel();

        let handle = controller
            .handle_command(peer(), ClientMessage::new("connect", ""), &sink)
            .await;
        assert!(handle.is_none());
        assert_eq!(controller.registry().len().await, 1);
        let emitted = drain(&mut events);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].action, Action::Rquota);

        assert!(
            controller
                .handle_command(peer(), ClientMessage::new("reboot", ""), &sink)
                .await
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn graph_link_prefills_run_window() -> Result<()> {
        let started = DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")?.with_timezone(&Utc);
        let finished = DateTime::parse_from_rfc3339("2024-05-01T09:30:05Z")?.with_timezone(&Utc);
        let archive = ArchiveInfo {
            started,
            finished,
            archive_url: ARCHIVE.to_string(),
        };
        assert_eq!(
            graph_link("https://abc-sandboxes.apps.example", &archive),
            "https://abc-sandboxes.apps.example/graph?g0.expr=up&g0.end_input=2024-05-01+09%3A30&g0.range_input=1h30m5s&g0.stacked=0&g0.tab=0"
        );
        Ok(())
    }

    #[test]
    fn durations_render_like_range_input() {
        assert_eq!(go_duration(chrono::Duration::zero()), "0s");
        assert_eq!(go_duration(chrono::Duration::seconds(59)), "59s");
        assert_eq!(go_duration(chrono::Duration::seconds(600)), "10m0s");
        assert_eq!(go_duration(chrono::Duration::seconds(7_261)), "2h1m1s");
        assert_eq!(go_duration(chrono::Duration::seconds(-90)), "-1m30s");
    }
}
