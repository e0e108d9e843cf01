use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info};

use crate::shutdown::Shutdown;

pub const READY_PATH: &str = "/-/ready";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{url} did not report ready within {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("readiness probe client init failed: {0}")]
    Client(String),
    #[error("readiness probe cancelled by shutdown")]
    Cancelled,
}

impl ProbeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "endpoint_timeout",
            Self::Client(_) => "probe_client_error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Waits until a provisioned route answers ready.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_ready(&self, route_url: &str, shutdown: &Shutdown) -> Result<(), ProbeError>;
}

#[derive(Clone, Debug)]
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HttpReadinessProbe {
    /// Route certificates are cluster-issued, so verification is disabled.
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|error| ProbeError::Client(error.to_string()))?;
        Ok(Self {
            client,
            interval,
            timeout,
        })
    }

    async fn poll(&self, url: &str) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let _ = ticker.tick().await;
            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => return,
                Ok(response) => {
                    debug!(url = %url, status = response.status().as_u16(), "endpoint not ready, retrying");
                }
                Err(error) => {
                    debug!(url = %url, reason = %error, "endpoint probe failed, retrying");
                }
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn wait_ready(&self, route_url: &str, shutdown: &Shutdown) -> Result<(), ProbeError> {
        let url = format!("{}{READY_PATH}", route_url.trim_end_matches('/'));
        tokio::select! {
            waited = tokio::time::timeout(self.timeout, self.poll(url.as_str())) => match waited {
                Ok(()) => {
                    info!(url = %url, "endpoint is ready");
                    Ok(())
                }
                Err(_) => Err(ProbeError::Timeout { url: url.clone(), timeout: self.timeout }),
            },
            () = shutdown.cancelled() => Err(ProbeError::Cancelled),
        }
    }
}
