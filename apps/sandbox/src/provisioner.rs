//! Builds and submits the three resources that make up one sandbox.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::app_label::AppLabel;
use crate::cluster::{ClusterApi, ClusterError, ResourceKind, route_host};

pub const FETCHER_CONTAINER: &str = "ci-fetcher";
pub const PROMETHEUS_CONTAINER: &str = "prometheus";
pub const PROMETHEUS_PORT: u16 = 9090;
const PORT_NAME: &str = "webui";
const STORAGE_VOLUME: &str = "prometheus-storage-volume";
const STORAGE_MOUNT: &str = "/prometheus/";
/// Extraction must survive re-runs of the init step against a half-filled volume.
const FETCH_COMMAND: &str = "set -uxo pipefail && umask 0000 && curl -sL ${PROMTAR} | tar xvz -m --no-overwrite-dir --skip-old-files";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadImages {
    pub fetcher: String,
    pub prometheus: String,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create new deployment: {0}")]
    Deployment(#[source] ClusterError),
    #[error("failed to create new service: {0}")]
    Service(#[source] ClusterError),
    #[error("failed to create route: {0}")]
    Route(#[source] ClusterError),
    #[error("route {0} has no host assigned")]
    MissingRouteHost(String),
}

impl ProvisionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Deployment(_) => "deployment_create_failed",
            Self::Service(_) => "service_create_failed",
            Self::Route(_) => "route_create_failed",
            Self::MissingRouteHost(_) => "route_host_missing",
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::Service(_) => ResourceKind::Service,
            Self::Route(_) | Self::MissingRouteHost(_) => ResourceKind::Route,
        }
    }
}

pub fn deployment_name(label: &AppLabel) -> String {
    format!("{label}-prom")
}

fn labels(label: &AppLabel) -> Value {
    json!({ "app": label.as_str() })
}

pub fn deployment_manifest(label: &AppLabel, archive_url: &str, images: &WorkloadImages) -> Value {
    let mount = json!([{ "name": STORAGE_VOLUME, "mountPath": STORAGE_MOUNT }]);
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": deployment_name(label), "labels": labels(label) },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels(label) },
            "template": {
                "metadata": { "labels": labels(label) },
                "spec": {
                    "shareProcessNamespace": true,
                    "initContainers": [{
                        "name": FETCHER_CONTAINER,
                        "image": images.fetcher,
                        "command": ["/bin/bash", "-c", FETCH_COMMAND],
                        "workingDir": STORAGE_MOUNT,
                        "env": [{ "name": "PROMTAR", "value": archive_url }],
                        "volumeMounts": mount,
                    }],
                    "containers": [{
                        "name": PROMETHEUS_CONTAINER,
                        "image": images.prometheus,
                        "ports": [{ "name": PORT_NAME, "protocol": "TCP", "containerPort": PROMETHEUS_PORT }],
                        "readinessProbe": {
                            "timeoutSeconds": 1,
                            "periodSeconds": 10,
                            "successThreshold": 1,
                            "failureThreshold": 3,
                            "httpGet": { "path": "/", "port": PROMETHEUS_PORT, "scheme": "HTTP" }
                        },
                        "resources": { "requests": { "cpu": "100m", "memory": "500Mi" } },
                        "volumeMounts": mount,
                    }],
                    "volumes": [{ "name": STORAGE_VOLUME, "emptyDir": {} }],
                }
            }
        }
    })
}

pub fn service_manifest(label: &AppLabel) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": label.as_str(), "labels": labels(label) },
        "spec": {
            "ports": [{ "name": PORT_NAME, "protocol": "TCP", "port": PROMETHEUS_PORT }],
            "selector": labels(label),
        }
    })
}

pub fn route_manifest(label: &AppLabel) -> Value {
    json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": { "name": label.as_str(), "labels": labels(label) },
        "spec": {
            "to": { "kind": "Service", "name": label.as_str() },
            "port": { "targetPort": PROMETHEUS_PORT },
            "tls": { "termination": "edge", "insecureEdgeTerminationPolicy": "Redirect" },
        }
    })
}

#[derive(Clone)]
pub struct WorkloadProvisioner {
    cluster: Arc<dyn ClusterApi>,
    images: WorkloadImages,
}

impl WorkloadProvisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, images: WorkloadImages) -> Self {
        Self { cluster, images }
    }

    /// Creates deployment, service and route in that order and returns the
    /// public `https://` URL. Nothing is rolled back when a later step fails.
    pub async fn provision(&self, label: &AppLabel, archive_url: &str) -> Result<String, ProvisionError> {
        let _ = self
            .cluster
            .create(
                ResourceKind::Deployment,
                deployment_manifest(label, archive_url, &self.images),
            )
            .await
            .map_err(ProvisionError::Deployment)?;
        let _ = self
            .cluster
            .create(ResourceKind::Service, service_manifest(label))
            .await
            .map_err(ProvisionError::Service)?;
        let route = self
            .cluster
            .create(ResourceKind::Route, route_manifest(label))
            .await
            .map_err(ProvisionError::Route)?;

        let host = match route_host(&route) {
            Some(host) => host,
            None => {
                let admitted = self
                    .cluster
                    .get(ResourceKind::Route, label.as_str())
                    .await
                    .map_err(ProvisionError::Route)?;
                route_host(&admitted)
                    .ok_or_else(|| ProvisionError::MissingRouteHost(label.to_string()))?
            }
        };
        tracing::info!(app_label = %label, host = %host, "sandbox resources created");
        Ok(format!("https://{host}"))
    }
}
