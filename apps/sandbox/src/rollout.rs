//! Follows a freshly provisioned workload until its archive download starts
//! and finishes, diagnosing the failing container when it stalls.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app_label::AppLabel;
use crate::cluster::{ClusterApi, ClusterError, ListParams, ObjectMeta, PodStatus, ResourceKind, deployment_replicas};
use crate::provisioner::{FETCHER_CONTAINER, deployment_name};
use crate::registry::EventSink;
use crate::shutdown::Shutdown;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// The workload came up but one of its containers never became ready.
    #[error("container {container} failed to start:\n{logs}")]
    ContainerStartup { container: String, logs: String },
    #[error("no pod found for deployment {deployment} after rollout stalled: {reason}")]
    PodNotFound { deployment: String, reason: String },
    #[error("failed to find failing container in pod {pod} created by deployment {deployment}: {reason}")]
    NoFailingContainer {
        pod: String,
        deployment: String,
        reason: String,
    },
    #[error("rollout diagnosis failed: {0}")]
    Cluster(#[from] ClusterError),
    #[error("rollout cancelled by shutdown")]
    Cancelled,
}

impl RolloutError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContainerStartup { .. } => "container_startup_failed",
            Self::PodNotFound { .. } => "pod_not_found",
            Self::NoFailingContainer { .. } => "no_failing_container",
            Self::Cluster(_) => "cluster_error",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum RolloutState {
    WaitCreated,
    WaitInitStarted,
    StreamInitLogs { pod: String },
    Diagnose { reason: String },
}

enum Step {
    Next(RolloutState),
    Finished,
}

#[derive(Clone)]
pub struct RolloutMonitor {
    cluster: Arc<dyn ClusterApi>,
    wait_timeout: Duration,
}

impl RolloutMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>, wait_timeout: Duration) -> Self {
        Self { cluster, wait_timeout }
    }

    /// Returns once the init step's log stream reaches EOF. Stalls end in a
    /// diagnosis error; success emits nothing beyond the forwarded log lines.
    pub async fn monitor(&self, label: &AppLabel, sink: &EventSink, shutdown: &Shutdown) -> Result<(), RolloutError> {
        tokio::select! {
            result = self.run(label, sink) => result,
            () = shutdown.cancelled() => Err(RolloutError::Cancelled),
        }
    }

    async fn run(&self, label: &AppLabel, sink: &EventSink) -> Result<(), RolloutError> {
        let mut state = RolloutState::WaitCreated;
        loop {
            debug!(app_label = %label, state = ?state, "rollout transition");
            let step = match state {
                RolloutState::WaitCreated => self.wait_created(label).await,
                RolloutState::WaitInitStarted => self.wait_init_started(label).await,
                RolloutState::StreamInitLogs { pod } => self.stream_init_logs(label, pod.as_str(), sink).await,
                RolloutState::Diagnose { reason } => {
                    warn!(app_label = %label, reason = %reason, "rollout stalled, diagnosing");
                    return Err(self.diagnose(label, reason).await);
                }
            };
            match step {
                Step::Next(next) => state = next,
                Step::Finished => return Ok(()),
            }
        }
    }

    async fn wait_created(&self, label: &AppLabel) -> Step {
        let name = deployment_name(label);
        let waited = tokio::time::timeout(self.wait_timeout, async {
            let mut events = self
                .cluster
                .watch(ResourceKind::Deployment, &ListParams::named(name.as_str()))
                .await?;
            while let Some(event) = events.next().await {
                if event?.object().is_some_and(|object| deployment_replicas(object) >= 1) {
                    return Ok(true);
                }
            }
            Ok::<bool, ClusterError>(false)
        })
        .await;
        match waited {
            Ok(Ok(true)) => Step::Next(RolloutState::WaitInitStarted),
            Ok(Ok(false)) => diagnose(format!("watch on deployment {name} closed")),
            Ok(Err(error)) => diagnose(format!("watch on deployment {name} failed: {error}")),
            Err(_) => diagnose(format!("timed out waiting for deployment {name} to create a replica")),
        }
    }

    async fn wait_init_started(&self, label: &AppLabel) -> Step {
        let waited = tokio::time::timeout(self.wait_timeout, async {
            let mut events = self
                .cluster
                .watch(ResourceKind::Pod, &ListParams::labels(label.selector()))
                .await?;
            while let Some(event) = events.next().await {
                let event = event?;
                let Some(pod) = event.object() else {
                    continue;
                };
                let started = PodStatus::of(pod)?
                    .init_container(FETCHER_CONTAINER)
                    .is_some_and(|status| status.has_started());
                if started {
                    return Ok(Some(ObjectMeta::of(pod)?.name));
                }
            }
            Ok::<Option<String>, ClusterError>(None)
        })
        .await;
        match waited {
            Ok(Ok(Some(pod))) => Step::Next(RolloutState::StreamInitLogs { pod }),
            Ok(Ok(None)) => diagnose("pod watch closed before the init step started".to_string()),
            Ok(Err(error)) => diagnose(format!("pod watch failed: {error}")),
            Err(_) => diagnose("timed out waiting for the init step to start".to_string()),
        }
    }

    async fn stream_init_logs(&self, label: &AppLabel, pod: &str, sink: &EventSink) -> Step {
        let mut lines = match self.cluster.logs(pod, FETCHER_CONTAINER, true).await {
            Ok(lines) => lines,
            Err(error) => return diagnose(format!("failed to open init log stream: {error}")),
        };
        let mut forwarded = 0usize;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => {
                    forwarded = forwarded.saturating_add(1);
                    let _ = sink.log(line);
                }
                Err(error) => return diagnose(format!("init log stream failed: {error}")),
            }
        }
        info!(app_label = %label, pod = %pod, lines = forwarded, "init step finished");
        Step::Finished
    }

    /// `reason` says why the rollout stalled and is carried into the error
    /// when no container logs can explain it.
    async fn diagnose(&self, label: &AppLabel, reason: String) -> RolloutError {
        let deployment = deployment_name(label);
        let pods = match self
            .cluster
            .list(ResourceKind::Pod, &ListParams::labels(label.selector()))
            .await
        {
            Ok(pods) => pods,
            Err(error) => return RolloutError::Cluster(error),
        };
        let Some(pod) = pods.first() else {
            return RolloutError::PodNotFound { deployment, reason };
        };
        let pod_name = match ObjectMeta::of(pod) {
            Ok(meta) => meta.name,
            Err(error) => return RolloutError::Cluster(error),
        };
        let container = match PodStatus::of(pod) {
            Ok(status) => match status.first_unready() {
                Some(container) => container.name.clone(),
                None => {
                    return RolloutError::NoFailingContainer {
                        pod: pod_name,
                        deployment,
                        reason,
                    };
                }
            },
            Err(error) => return RolloutError::Cluster(error),
        };

        let mut stream = match self.cluster.logs(pod_name.as_str(), container.as_str(), false).await {
            Ok(stream) => stream,
            Err(error) => return RolloutError::Cluster(error),
        };
        let mut logs = Vec::new();
        while let Some(line) = stream.next().await {
            match line {
                Ok(line) => logs.push(line),
                Err(error) => {
                    logs.push(format!("<log stream interrupted: {error}>"));
                    break;
                }
            }
        }
        RolloutError::ContainerStartup {
            container,
            logs: logs.join("\n"),
        }
    }
}

fn diagnose(reason: String) -> Step {
    Step::Next(RolloutState::Diagnose { reason })
}
