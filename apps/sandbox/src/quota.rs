//! Live mirror of the namespace pod quota, republished to every observer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sandbox_protocol::{QuotaSnapshot, StatusEvent};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, ClusterError, ListParams, ObjectMeta, ResourceKind, quota_pods};
use crate::registry::SessionRegistry;
use crate::shutdown::Shutdown;

/// Doubling reconnect delay, capped, reset after each successful watch open.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

pub struct QuotaTracker {
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<SessionRegistry>,
    quota_name: String,
    snapshot: RwLock<QuotaSnapshot>,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

impl QuotaTracker {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        registry: Arc<SessionRegistry>,
        quota_name: &str,
        reconnect_base: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            cluster,
            registry,
            quota_name: quota_name.to_string(),
            snapshot: RwLock::new(QuotaSnapshot::default()),
            reconnect_base,
            reconnect_max,
        }
    }

    pub async fn snapshot(&self) -> QuotaSnapshot {
        *self.snapshot.read().await
    }

    /// One synchronous read of the quota object, replacing and broadcasting
    /// the snapshot.
    pub async fn initialize(&self) -> Result<QuotaSnapshot, ClusterError> {
        let object = self
            .cluster
            .get(ResourceKind::ResourceQuota, self.quota_name.as_str())
            .await?;
        let (used, hard) = quota_pods(&object)?;
        let snapshot = QuotaSnapshot::new(used, hard);
        self.replace(snapshot).await;
        Ok(snapshot)
    }

    async fn replace(&self, snapshot: QuotaSnapshot) {
        *self.snapshot.write().await = snapshot;
        let delivered = self.registry.broadcast(&StatusEvent::quota(snapshot)).await;
        info!(used = snapshot.used, hard = snapshot.hard, observers = delivered, "quota updated");
    }

    /// Watches the quota until shutdown, reopening the watch whenever it fails
    /// or closes.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut backoff = ReconnectBackoff::new(self.reconnect_base, self.reconnect_max);
        loop {
            let outcome = tokio::select! {
                outcome = self.watch_once(&mut backoff) => outcome,
                () = shutdown.cancelled() => break,
            };
            match outcome {
                Ok(()) => info!(quota = %self.quota_name, "quota watch closed, reconnecting"),
                Err(error) => warn!(
                    quota = %self.quota_name,
                    reason = %error,
                    code = error.code(),
                    "quota watch failed, reconnecting"
                ),
            }
            let delay = backoff.next_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
        }
        info!(quota = %self.quota_name, "quota tracker stopped");
    }

    async fn watch_once(&self, backoff: &mut ReconnectBackoff) -> Result<(), ClusterError> {
        let mut events = self
            .cluster
            .watch(
                ResourceKind::ResourceQuota,
                &ListParams::named(self.quota_name.as_str()),
            )
            .await?;
        backoff.reset();
        while let Some(event) = events.next().await {
            let event = event?;
            let Some(object) = event.object() else {
                continue;
            };
            let matches = ObjectMeta::of(object).is_ok_and(|meta| meta.name == self.quota_name);
            if !matches {
                continue;
            }
            match quota_pods(object) {
                Ok((used, hard)) => self.replace(QuotaSnapshot::new(used, hard)).await,
                Err(error) => warn!(reason = %error, "ignoring undecodable quota event"),
            }
        }
        Ok(())
    }
}
