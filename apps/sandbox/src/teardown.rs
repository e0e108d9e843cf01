//! Removes every resource carrying one sandbox's label.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::app_label::{AppLabel, AppLabelIssuer};
use crate::cluster::{ClusterApi, ClusterError, ListParams, ObjectMeta, ResourceKind};
use crate::dashboard::{Dashboard, DashboardError};

/// Deletion order. A failure on one kind skips every later kind.
pub const TEARDOWN_ORDER: [ResourceKind; 4] = [
    ResourceKind::Service,
    ResourceKind::Deployment,
    ResourceKind::ConfigMap,
    ResourceKind::Route,
];

fn display_kind(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ConfigMap => "config map",
        other => other.as_str(),
    }
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to find {}s: {source}", display_kind(*kind))]
    List {
        kind: ResourceKind,
        removed: Vec<String>,
        #[source]
        source: ClusterError,
    },
    #[error("error removing {} {name}: {source}", display_kind(*kind))]
    Delete {
        kind: ResourceKind,
        name: String,
        removed: Vec<String>,
        #[source]
        source: ClusterError,
    },
    #[error("failed to remove dashboard data source: {source}")]
    Dashboard {
        removed: Vec<String>,
        #[source]
        source: DashboardError,
    },
}

impl TeardownError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::List { .. } => "teardown_list_failed",
            Self::Delete { .. } => "teardown_delete_failed",
            Self::Dashboard { .. } => "teardown_dashboard_failed",
        }
    }

    /// Log lines for the resources deleted before the failure.
    pub fn removed(&self) -> &[String] {
        match self {
            Self::List { removed, .. } | Self::Delete { removed, .. } | Self::Dashboard { removed, .. } => {
                removed.as_slice()
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    pub data_source: Option<i64>,
}

impl TeardownReport {
    pub fn log(&self) -> String {
        self.removed.join("\n")
    }
}

/// Clones share the label issuer, so a sandbox removed by the collector
/// frees its label for the session controller.
#[derive(Clone)]
pub struct Teardown {
    cluster: Arc<dyn ClusterApi>,
    dashboard: Dashboard,
    issuer: Arc<AppLabelIssuer>,
}

impl Teardown {
    pub fn new(cluster: Arc<dyn ClusterApi>, dashboard: Dashboard) -> Self {
        Self {
            cluster,
            dashboard,
            issuer: Arc::new(AppLabelIssuer::new()),
        }
    }

    pub fn issuer(&self) -> &Arc<AppLabelIssuer> {
        &self.issuer
    }

    /// Deletes the label's resources kind by kind, then its dashboard data
    /// source. Nothing already removed is restored on failure.
    pub async fn remove(&self, label: &AppLabel) -> Result<TeardownReport, TeardownError> {
        let selector = ListParams::labels(label.selector());
        let mut removed = Vec::new();
        for kind in TEARDOWN_ORDER {
            let objects = match self.cluster.list(kind, &selector).await {
                Ok(objects) => objects,
                Err(source) => return Err(TeardownError::List { kind, removed, source }),
            };
            for object in objects {
                let name = match ObjectMeta::of(&object) {
                    Ok(meta) => meta.name,
                    Err(source) => return Err(TeardownError::List { kind, removed, source }),
                };
                if let Err(source) = self.cluster.delete(kind, name.as_str()).await {
                    warn!(app_label = %label, kind = kind.as_str(), name = %name, reason = %source, "resource delete failed");
                    return Err(TeardownError::Delete {
                        kind,
                        name,
                        removed,
                        source,
                    });
                }
                removed.push(format!("Removed {} {name}", display_kind(kind)));
            }
        }

        let data_source = match self.dashboard.unregister(label).await {
            Ok(id) => id,
            Err(source) => return Err(TeardownError::Dashboard { removed, source }),
        };
        self.issuer.release(label);
        info!(app_label = %label, removed = removed.len(), "sandbox removed");
        Ok(TeardownReport { removed, data_source })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use serde_json::json;

    use super::{Teardown, TeardownError};
    use crate::app_label::AppLabel;
    use crate::cluster::{InMemoryCluster, ResourceKind};
    use crate::dashboard::Dashboard;

    async fn seed(cluster: &InMemoryCluster, label: &str) -> Result<()> {
        let labels = json!({ "app": label });
        cluster
            .upsert(ResourceKind::Service, json!({"metadata": {"name": label, "labels": labels}}))
            .await?;
        cluster
            .upsert(
                ResourceKind::Deployment,
                json!({"metadata": {"name": format!("{label}-prom"), "labels": labels}}),
            )
            .await?;
        cluster
            .upsert(
                ResourceKind::ConfigMap,
                json!({"metadata": {"name": format!("{label}-config"), "labels": labels}}),
            )
            .await?;
        cluster
            .upsert(ResourceKind::Route, json!({"metadata": {"name": label, "labels": labels}}))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn removes_every_kind_in_order_and_leaves_other_sandboxes() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        seed(&cluster, "abcdefgh").await?;
        seed(&cluster, "zyxwvuts").await?;
        let teardown = Teardown::new(cluster.clone(), Dashboard::disabled());

        let report = teardown.remove(&AppLabel::parse("abcdefgh")?).await?;
        assert_eq!(
            report.removed,
            vec![
                "Removed service abcdefgh",
                "Removed deployment abcdefgh-prom",
                "Removed config map abcdefgh-config",
                "Removed route abcdefgh",
            ]
        );
        assert_eq!(report.data_source, None);
        assert_eq!(cluster.names(ResourceKind::Service).await, vec!["zyxwvuts"]);
        assert_eq!(cluster.names(ResourceKind::Route).await, vec!["zyxwvuts"]);
        Ok(())
    }

    #[tokio::test]
    async fn stops_at_first_failing_kind_and_reports_prior_removals() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        seed(&cluster, "abcdefgh").await?;
        cluster.fail_delete(ResourceKind::Deployment, "forbidden").await;
        let teardown = Teardown::new(cluster.clone(), Dashboard::disabled());

        let error = teardown
            .remove(&AppLabel::parse("abcdefgh")?)
            .await
            .expect_err("deployment delete fails");
        assert!(matches!(error, TeardownError::Delete { kind: ResourceKind::Deployment, .. }));
        assert_eq!(error.removed(), ["Removed service abcdefgh".to_string()]);
        assert!(error.to_string().starts_with("error removing deployment abcdefgh-prom"));
        // Later kinds are never attempted.
        assert_eq!(cluster.names(ResourceKind::ConfigMap).await, vec!["abcdefgh-config"]);
        assert_eq!(cluster.names(ResourceKind::Route).await, vec!["abcdefgh"]);
        Ok(())
    }

    #[tokio::test]
    async fn removal_releases_the_issued_label() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        let teardown = Teardown::new(cluster.clone(), Dashboard::disabled());
        let label = teardown.issuer().issue();
        seed(&cluster, label.as_str()).await?;
        assert_eq!(teardown.issuer().live_count(), 1);

        let _ = teardown.clone().remove(&label).await?;
        assert_eq!(teardown.issuer().live_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_removal_keeps_the_label_held() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        cluster.fail_delete(ResourceKind::Service, "forbidden").await;
        let teardown = Teardown::new(cluster.clone(), Dashboard::disabled());
        let label = teardown.issuer().issue();
        seed(&cluster, label.as_str()).await?;

        assert!(teardown.remove(&label).await.is_err());
        assert_eq!(teardown.issuer().live_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_label_removes_nothing() -> Result<()> {
        let cluster = Arc::new(InMemoryCluster::new("sandboxes"));
        let teardown = Teardown::new(cluster, Dashboard::disabled());
        let report = teardown.remove(&AppLabel::parse("missing")?).await?;
        assert!(report.removed.is_empty());
        assert_eq!(report.log(), "");
        Ok(())
    }
}
