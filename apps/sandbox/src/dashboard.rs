//! Optional dashboard data-source registration for provisioned sandboxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::app_label::AppLabel;
use crate::config::DashboardConfig;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("failed to perform request {url}: {message}")]
    Transport { url: String, message: String },
    #[error("dashboard request {url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("failed to unmarshal response {body}: {message}")]
    Decode { body: String, message: String },
}

impl DashboardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "dashboard_unreachable",
            Self::Status { .. } => "dashboard_rejected",
            Self::Decode { .. } => "dashboard_decode_failed",
        }
    }
}

#[async_trait]
pub trait DashboardClient: Send + Sync {
    fn base_url(&self) -> Option<&str>;

    async fn create_data_source(&self, name: &str, url: &str) -> Result<i64, DashboardError>;

    async fn delete_data_source(&self, id: i64) -> Result<(), DashboardError>;
}

/// Used when no dashboard is configured; registration is skipped entirely.
#[derive(Debug, Default)]
pub struct NoopDashboard;

#[async_trait]
impl DashboardClient for NoopDashboard {
    fn base_url(&self) -> Option<&str> {
        None
    }

    async fn create_data_source(&self, _name: &str, _url: &str) -> Result<i64, DashboardError> {
        Ok(0)
    }

    async fn delete_data_source(&self, _id: i64) -> Result<(), DashboardError> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DataSourceRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
    access: &'static str,
    basic_auth: bool,
}

#[derive(Deserialize)]
struct DataSourceIdentity {
    id: i64,
}

#[derive(Deserialize)]
struct DataSourceResponse {
    #[serde(default)]
    datasource: Option<DataSourceIdentity>,
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct GrafanaDashboard {
    client: reqwest::Client,
    config: DashboardConfig,
    timeout: Duration,
}

impl GrafanaDashboard {
    pub fn new(config: DashboardConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            timeout,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .timeout(self.timeout)
            .header("authorization", format!("Bearer {}", self.config.token))
            .header("cookie", self.config.cookie.as_str())
            .header("accept", "application/json")
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, DashboardError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| DashboardError::Transport {
                url: url.to_string(),
                message: error.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DashboardError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl DashboardClient for GrafanaDashboard {
    fn base_url(&self) -> Option<&str> {
        Some(self.config.base_url.as_str())
    }

    async fn create_data_source(&self, name: &str, url: &str) -> Result<i64, DashboardError> {
        let endpoint = format!("{}/api/datasources", self.config.base_url);
        let request = self.client.post(endpoint.as_str()).json(&DataSourceRequest {
            name,
            kind: "prometheus",
            url,
            access: "proxy",
            basic_auth: false,
        });
        let body = self.send(request, endpoint.as_str()).await?;
        let parsed = serde_json::from_str::<DataSourceResponse>(body.as_str()).map_err(|error| {
            DashboardError::Decode {
                body: body.clone(),
                message: error.to_string(),
            }
        })?;
        parsed
            .datasource
            .map(|datasource| datasource.id)
            .or(parsed.id)
            .ok_or_else(|| DashboardError::Decode {
                body,
                message: "response carries no data source id".to_string(),
            })
    }

    async fn delete_data_source(&self, id: i64) -> Result<(), DashboardError> {
        let endpoint = format!("{}/api/datasources/{id}", self.config.base_url);
        let request = self.client.delete(endpoint.as_str());
        let _ = self.send(request, endpoint.as_str()).await?;
        Ok(())
    }
}

/// Data-source ids keyed by the sandbox they point at. Create and delete
/// tasks touch it concurrently, so every access goes through the lock.
#[derive(Clone)]
pub struct Dashboard {
    client: Arc<dyn DashboardClient>,
    sources: Arc<Mutex<HashMap<AppLabel, i64>>>,
}

impl Dashboard {
    pub fn new(client: Arc<dyn DashboardClient>) -> Self {
        Self {
            client,
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopDashboard))
    }

    pub fn from_config(config: Option<DashboardConfig>, timeout: Duration) -> Self {
        match config {
            Some(config) => Self::new(Arc::new(GrafanaDashboard::new(config, timeout))),
            None => Self::disabled(),
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.client.base_url()
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url().is_some()
    }

    /// Creates a data source named after the sandbox. Returns `None` when the
    /// integration is disabled.
    pub async fn register(&self, label: &AppLabel, route_url: &str) -> Result<Option<i64>, DashboardError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let id = self.client.create_data_source(label.as_str(), route_url).await?;
        let _ = self.sources.lock().await.insert(label.clone(), id);
        tracing::info!(app_label = %label, datasource_id = id, "dashboard data source added");
        Ok(Some(id))
    }

    /// Removes the data source registered for `label`, if any. The id stays
    /// registered when the dashboard rejects the delete so it can be retried.
    pub async fn unregister(&self, label: &AppLabel) -> Result<Option<i64>, DashboardError> {
        let Some(id) = self.sources.lock().await.get(label).copied() else {
            return Ok(None);
        };
        self.client.delete_data_source(id).await?;
        let _ = self.sources.lock().await.remove(label);
        tracing::info!(app_label = %label, datasource_id = id, "dashboard data source removed");
        Ok(Some(id))
    }

    pub async fn registered(&self, label: &AppLabel) -> Option<i64> {
        self.sources.lock().await.get(label).copied()
    }
}
