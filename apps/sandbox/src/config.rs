use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "promecieus";
pub const DEFAULT_QUOTA_NAME: &str = "pod-quota";
pub const DEFAULT_CLUSTER_API_URL: &str = "https://kubernetes.default.svc";
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const DEFAULT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
pub const DEFAULT_FETCHER_IMAGE: &str = "registry.access.redhat.com/ubi8/ubi:8.6";
pub const DEFAULT_PROMETHEUS_IMAGE: &str = "quay.io/tjungblu/patched-prometheus:ignorecheck-e1feeff";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
    }
}

/// Credentials for the optional dashboard integration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DashboardConfig {
    pub base_url: String,
    pub token: String,
    pub cookie: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub namespace: String,
    pub quota_name: String,
    pub cluster_api_url: String,
    pub cluster_token: Option<String>,
    pub cluster_token_path: PathBuf,
    pub cluster_ca_path: PathBuf,
    pub dashboard: Option<DashboardConfig>,
    pub fetch_timeout_ms: u64,
    pub rollout_timeout_seconds: u64,
    pub probe_timeout_seconds: u64,
    pub probe_interval_ms: u64,
    pub workload_ttl_seconds: u64,
    pub gc_interval_seconds: u64,
    pub quota_reconnect_base_ms: u64,
    pub quota_reconnect_max_ms: u64,
    pub fetcher_image: String,
    pub prometheus_image: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SANDBOX_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid SANDBOX_NAMESPACE: {0}")]
    InvalidNamespace(String),
    #[error("invalid SANDBOX_CLUSTER_API_URL: {0}")]
    InvalidClusterApiUrl(String),
    #[error("invalid SANDBOX_DASHBOARD_URL: {0}")]
    InvalidDashboardUrl(String),
    #[error("invalid duration setting: {0}")]
    InvalidDuration(String),
    #[error("invalid SANDBOX_QUOTA_RECONNECT_MAX_MS: {0}")]
    InvalidQuotaReconnectBackoff(String),
    #[error("invalid SANDBOX_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BindAddrParse(_) => "invalid_bind_addr",
            Self::InvalidNamespace(_) => "invalid_namespace",
            Self::InvalidClusterApiUrl(_) => "invalid_cluster_api_url",
            Self::InvalidDashboardUrl(_) => "invalid_dashboard_url",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::InvalidQuotaReconnectBackoff(_) => "invalid_quota_reconnect_backoff",
            Self::InvalidLogFormat(_) => "invalid_log_format",
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. `SANDBOX_*` names win over
    /// the bare legacy names (`NAMESPACE`, `QUOTA_NAME`, `GRAFANA_*`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let with_fallback =
            |primary: &str, legacy: &str| non_empty(primary).or_else(|| non_empty(legacy));

        let bind_addr = non_empty("SANDBOX_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()?;
        let service_name =
            non_empty("SANDBOX_SERVICE_NAME").unwrap_or_else(|| "promsandbox".to_string());

        let namespace = with_fallback("SANDBOX_NAMESPACE", "NAMESPACE")
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        validate_namespace(namespace.as_str())?;
        let quota_name = with_fallback("SANDBOX_QUOTA_NAME", "QUOTA_NAME")
            .unwrap_or_else(|| DEFAULT_QUOTA_NAME.to_string());

        let cluster_api_url = non_empty("SANDBOX_CLUSTER_API_URL")
            .unwrap_or_else(|| DEFAULT_CLUSTER_API_URL.to_string());
        let cluster_api_url = normalize_http_url(cluster_api_url.as_str())
            .ok_or(ConfigError::InvalidClusterApiUrl(cluster_api_url.clone()))?;
        let cluster_token = non_empty("SANDBOX_CLUSTER_TOKEN");
        let cluster_token_path = PathBuf::from(
            non_empty("SANDBOX_CLUSTER_TOKEN_PATH").unwrap_or_else(|| DEFAULT_TOKEN_PATH.to_string()),
        );
        let cluster_ca_path = PathBuf::from(
            non_empty("SANDBOX_CLUSTER_CA_PATH").unwrap_or_else(|| DEFAULT_CA_PATH.to_string()),
        );

        let dashboard = match (
            with_fallback("SANDBOX_DASHBOARD_URL", "GRAFANA_URL"),
            with_fallback("SANDBOX_DASHBOARD_TOKEN", "GRAFANA_TOKEN"),
            with_fallback("SANDBOX_DASHBOARD_COOKIE", "GRAFANA_COOKIE"),
        ) {
            (Some(url), Some(token), Some(cookie)) => Some(DashboardConfig {
                base_url: normalize_http_url(url.as_str())
                    .ok_or(ConfigError::InvalidDashboardUrl(url.clone()))?,
                token,
                cookie,
            }),
            _ => None,
        };

        let fetch_timeout_ms = parse_u64_lookup(&lookup, "SANDBOX_FETCH_TIMEOUT_MS", 10_000, 250, 120_000)?;
        let rollout_timeout_seconds =
            parse_u64_lookup(&lookup, "SANDBOX_ROLLOUT_TIMEOUT_SECONDS", 60, 1, 3_600)?;
        let probe_timeout_seconds =
            parse_u64_lookup(&lookup, "SANDBOX_PROBE_TIMEOUT_SECONDS", 300, 1, 3_600)?;
        let probe_interval_ms =
            parse_u64_lookup(&lookup, "SANDBOX_PROBE_INTERVAL_MS", 1_000, 10, 60_000)?;
        let workload_ttl_seconds =
            parse_u64_lookup(&lookup, "SANDBOX_WORKLOAD_TTL_SECONDS", 14_400, 1, 7 * 86_400)?;
        let gc_interval_seconds =
            parse_u64_lookup(&lookup, "SANDBOX_GC_INTERVAL_SECONDS", 120, 1, 86_400)?;
        let quota_reconnect_base_ms =
            parse_u64_lookup(&lookup, "SANDBOX_QUOTA_RECONNECT_BASE_MS", 500, 1, 60_000)?;
        let quota_reconnect_max_ms =
            parse_u64_lookup(&lookup, "SANDBOX_QUOTA_RECONNECT_MAX_MS", 30_000, 1, 600_000)?;
        if quota_reconnect_max_ms < quota_reconnect_base_ms {
            return Err(ConfigError::InvalidQuotaReconnectBackoff(format!(
                "max {quota_reconnect_max_ms}ms is below base {quota_reconnect_base_ms}ms"
            )));
        }

        let fetcher_image =
            non_empty("SANDBOX_FETCHER_IMAGE").unwrap_or_else(|| DEFAULT_FETCHER_IMAGE.to_string());
        let prometheus_image = non_empty("SANDBOX_PROMETHEUS_IMAGE")
            .unwrap_or_else(|| DEFAULT_PROMETHEUS_IMAGE.to_string());
        let log_format = LogFormat::parse(
            lookup("SANDBOX_LOG_FORMAT")
                .unwrap_or_else(|| "text".to_string())
                .as_str(),
        )?;

        Ok(Self {
            service_name,
            bind_addr,
            namespace,
            quota_name,
            cluster_api_url,
            cluster_token,
            cluster_token_path,
            cluster_ca_path,
            dashboard,
            fetch_timeout_ms,
            rollout_timeout_seconds,
            probe_timeout_seconds,
            probe_interval_ms,
            workload_ttl_seconds,
            gc_interval_seconds,
            quota_reconnect_base_ms,
            quota_reconnect_max_ms,
            fetcher_image,
            prometheus_image,
            log_format,
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn rollout_timeout(&self) -> Duration {
        Duration::from_secs(self.rollout_timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn workload_ttl(&self) -> Duration {
        Duration::from_secs(self.workload_ttl_seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }
}

fn validate_namespace(namespace: &str) -> Result<(), ConfigError> {
    let valid = !namespace.is_empty()
        && namespace.len() <= 63
        && namespace
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        && !namespace.starts_with('-')
        && !namespace.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidNamespace(namespace.to_string()))
    }
}

fn normalize_http_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = reqwest::Url::parse(trimmed).ok()?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Some(trimmed.to_string()),
        _ => None,
    }
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidDuration(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max)),
        None => Ok(default),
    }
}
