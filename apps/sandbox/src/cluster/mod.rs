//! Namespaced resource access used by every cluster-facing component.
//!
//! Objects travel as raw JSON manifests; the typed views below decode only the
//! fields the orchestrator reads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::KubeHttpClient;
pub use memory::{InMemoryCluster, RolloutBehavior};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Deployment,
    Service,
    ConfigMap,
    Route,
    Pod,
    ResourceQuota,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::ConfigMap => "configmap",
            Self::Route => "route",
            Self::Pod => "pod",
            Self::ResourceQuota => "resourcequota",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::Service => "services",
            Self::ConfigMap => "configmaps",
            Self::Route => "routes",
            Self::Pod => "pods",
            Self::ResourceQuota => "resourcequotas",
        }
    }

    /// API group path prefix, without the namespace segment.
    pub fn api_prefix(&self) -> &'static str {
        match self {
            Self::Deployment => "/apis/apps/v1",
            Self::Route => "/apis/route.openshift.io/v1",
            Self::Service | Self::ConfigMap | Self::Pod | Self::ResourceQuota => "/api/v1",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListParams {
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            field_selector: None,
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            label_selector: None,
            field_selector: Some(format!("metadata.name={name}")),
        }
    }

    /// Client-side evaluation of the equality selectors this crate emits.
    pub fn matches(&self, object: &Value) -> bool {
        let Ok(meta) = ObjectMeta::of(object) else {
            return false;
        };
        let labels_match = self.label_selector.as_deref().is_none_or(|selector| {
            parse_equality_selector(selector).iter().all(|(key, value)| {
                meta.labels.get(key.as_str()).map(String::as_str) == Some(value.as_str())
            })
        });
        let fields_match = self.field_selector.as_deref().is_none_or(|selector| {
            parse_equality_selector(selector).iter().all(|(key, value)| {
                match key.as_str() {
                    "metadata.name" => meta.name == *value,
                    "metadata.namespace" => meta.namespace.as_deref() == Some(value.as_str()),
                    _ => false,
                }
            })
        });
        labels_match && fields_match
    }
}

fn parse_equality_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|term| {
            let (key, value) = term.split_once('=')?;
            let key = key.trim().trim_end_matches('=');
            Some((key.to_string(), value.trim_start_matches('=').trim().to_string()))
        })
        .collect()
}

/// One resource-change notification.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark,
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Value> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            Self::Bookmark => None,
        }
    }
}

/// Lazy, potentially infinite, not restartable. Open a new watch after it ends.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;
pub type LogStream = BoxStream<'static, Result<String, ClusterError>>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("cluster api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("cluster api transport error: {0}")]
    Transport(String),
    #[error("failed to decode cluster object: {0}")]
    Decode(String),
    #[error("watch failed: {0}")]
    Watch(String),
    #[error("cluster client misconfigured: {0}")]
    Config(String),
    #[error("stream line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },
}

impl ClusterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Api { .. } => "api_error",
            Self::Transport(_) => "transport_error",
            Self::Decode(_) => "decode_error",
            Self::Watch(_) => "watch_error",
            Self::Config(_) => "invalid_config",
            Self::LineTooLong { .. } => "line_too_long",
        }
    }
}

/// Create/get/list/delete/watch over namespaced resources plus per-container
/// log streaming.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespace(&self) -> &str;

    async fn create(&self, kind: ResourceKind, manifest: Value) -> Result<Value, ClusterError>;

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value, ClusterError>;

    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<Vec<Value>, ClusterError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    async fn watch(&self, kind: ResourceKind, params: &ListParams) -> Result<WatchStream, ClusterError>;

    async fn logs(&self, pod: &str, container: &str, follow: bool) -> Result<LogStream, ClusterError>;
}

fn decode<T: DeserializeOwned>(object: &Value) -> Result<T, ClusterError> {
    T::deserialize(object).map_err(|error| ClusterError::Decode(error.to_string()))
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn of(object: &Value) -> Result<Self, ClusterError> {
        match object.get("metadata") {
            Some(metadata) => decode(metadata),
            None => Err(ClusterError::Decode("object has no metadata".to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatusView {
    #[serde(default)]
    replicas: i64,
}

/// Replica count reported by a deployment; zero while nothing exists yet.
pub fn deployment_replicas(object: &Value) -> i64 {
    object
        .get("status")
        .and_then(|status| decode::<DeploymentStatusView>(status).ok())
        .map_or(0, |status| status.replicas)
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub started: Option<bool>,
    #[serde(default)]
    pub state: ContainerState,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ContainerState {
    #[serde(default)]
    pub waiting: Option<Value>,
    #[serde(default)]
    pub running: Option<Value>,
    #[serde(default)]
    pub terminated: Option<Value>,
}

impl ContainerStatus {
    /// True once the container process has been launched at least once.
    pub fn has_started(&self) -> bool {
        self.started == Some(true) || self.state.running.is_some() || self.state.terminated.is_some()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    pub fn of(object: &Value) -> Result<Self, ClusterError> {
        match object.get("status") {
            Some(status) => decode(status),
            None => Ok(Self::default()),
        }
    }

    pub fn init_container(&self, name: &str) -> Option<&ContainerStatus> {
        self.init_container_statuses
            .iter()
            .find(|status| status.name == name)
    }

    /// First container that is not ready; init containers take priority.
    pub fn first_unready(&self) -> Option<&ContainerStatus> {
        self.init_container_statuses
            .iter()
            .chain(self.container_statuses.iter())
            .find(|status| !status.ready)
    }
}

/// Reads `status.used.pods` / `status.hard.pods` from a resource quota.
pub fn quota_pods(object: &Value) -> Result<(i64, i64), ClusterError> {
    let status = object
        .get("status")
        .ok_or_else(|| ClusterError::Decode("resource quota has no status".to_string()))?;
    let read = |section: &str| -> Result<i64, ClusterError> {
        let raw = status.get(section).and_then(|values| values.get("pods"));
        match raw {
            None => Ok(0),
            Some(Value::Number(number)) => number
                .as_i64()
                .ok_or_else(|| ClusterError::Decode(format!("{section}.pods is not an integer"))),
            Some(Value::String(text)) => parse_quantity(text)
                .ok_or_else(|| ClusterError::Decode(format!("{section}.pods={text} is not a count"))),
            Some(other) => Err(ClusterError::Decode(format!(
                "{section}.pods has unexpected shape {other}"
            ))),
        }
    };
    Ok((read("used")?, read("hard")?))
}

fn parse_quantity(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.strip_suffix('k') {
        Some(digits) => (digits, 1_000),
        None => (raw, 1),
    };
    digits.parse::<i64>().ok().map(|value| value.saturating_mul(multiplier))
}

/// Host assigned to a route, if the router has admitted it yet.
pub fn route_host(object: &Value) -> Option<String> {
    object
        .get("spec")
        .and_then(|spec| spec.get("host"))
        .and_then(Value::as_str)
        .filter(|host| !host.is_empty())
        .map(ToString::to_string)
}
