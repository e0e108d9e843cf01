//! Periodic sweep that reclaims sandboxes older than the workload lifetime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app_label::AppLabel;
use crate::cluster::{ClusterApi, ClusterError, ListParams, ObjectMeta, ResourceKind};
use crate::shutdown::Shutdown;
use crate::teardown::Teardown;

/// A workload is expired only once strictly more than `ttl` has elapsed.
pub fn is_expired(now: DateTime<Utc>, created: DateTime<Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(created) > ttl,
        Err(_) => false,
    }
}

/// Labels of the workloads due for deletion. Workloads without an app label
/// or creation timestamp are skipped.
pub fn select_expired(now: DateTime<Utc>, ttl: Duration, workloads: &[ObjectMeta]) -> Vec<AppLabel> {
    workloads
        .iter()
        .filter_map(|meta| {
            let Some(raw) = meta.labels.get("app") else {
                debug!(deployment = %meta.name, "deployment has no app label, skipping");
                return None;
            };
            let created = meta.creation_timestamp?;
            if !is_expired(now, created, ttl) {
                return None;
            }
            match AppLabel::parse(raw) {
                Ok(label) => Some(label),
                Err(error) => {
                    warn!(deployment = %meta.name, reason = %error, "deployment carries an invalid app label");
                    None
                }
            }
        })
        .collect()
}

pub struct GarbageCollector {
    cluster: Arc<dyn ClusterApi>,
    teardown: Teardown,
    ttl: Duration,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(cluster: Arc<dyn ClusterApi>, teardown: Teardown, ttl: Duration, interval: Duration) -> Self {
        Self {
            cluster,
            teardown,
            ttl,
            interval,
        }
    }

    /// Lists deployments and launches a detached teardown for every expired
    /// one. Teardown outcomes are only logged.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<AppLabel>, ClusterError> {
        let deployments = self
            .cluster
            .list(ResourceKind::Deployment, &ListParams::default())
            .await?;
        let workloads = deployments
            .iter()
            .filter_map(|object| ObjectMeta::of(object).ok())
            .collect::<Vec<_>>();
        let expired = select_expired(now, self.ttl, &workloads);
        info!(
            deployments = workloads.len(),
            expired = expired.len(),
            "garbage collection sweep"
        );

        for label in &expired {
            let teardown = self.teardown.clone();
            let label = label.clone();
            tokio::spawn(async move {
                match teardown.remove(&label).await {
                    Ok(report) => info!(app_label = %label, removed = report.removed.len(), "expired sandbox collected"),
                    Err(error) => warn!(
                        app_label = %label,
                        reason = %error,
                        code = error.code(),
                        "expired sandbox collection failed"
                    ),
                }
            });
        }
        Ok(expired)
    }

    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            if let Err(error) = self.sweep(Utc::now()).await {
                warn!(reason = %error, code = error.code(), "garbage collection sweep failed");
            }
        }
        info!("garbage collector stopped");
    }
}
