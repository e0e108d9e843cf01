//! Classification of pipeline failures into the event an observer receives.

use sandbox_protocol::Action;
use thiserror::Error;

use crate::app_label::AppLabelError;
use crate::dashboard::DashboardError;
use crate::prober::ProbeError;
use crate::provisioner::ProvisionError;
use crate::resolver::ResolveError;
use crate::rollout::RolloutError;
use crate::teardown::TeardownError;

/// Failure of one create or delete pipeline, as reported to its observer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to find metrics archive: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Failed to run a new app: {0}")]
    Provision(#[from] ProvisionError),
    #[error("{0}")]
    Rollout(#[from] RolloutError),
    #[error("Failed to wait for the endpoint: {0}")]
    Probe(#[from] ProbeError),
    #[error("Failed to add dashboard data source: {0}")]
    Dashboard(#[from] DashboardError),
    #[error("{0}")]
    Teardown(#[from] TeardownError),
    #[error("Invalid app label: {0}")]
    InvalidLabel(#[from] AppLabelError),
}

impl PipelineError {
    /// Container startup diagnoses are user-actionable; everything else
    /// aborted the pipeline.
    pub fn action(&self) -> Action {
        match self {
            Self::Rollout(RolloutError::ContainerStartup { .. }) => Action::Error,
            _ => Action::Failure,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolve(error) => error.code(),
            Self::Provision(error) => error.code(),
            Self::Rollout(error) => error.code(),
            Self::Probe(error) => error.code(),
            Self::Dashboard(error) => error.code(),
            Self::Teardown(error) => error.code(),
            Self::InvalidLabel(_) => "invalid_app_label",
        }
    }

    /// Text shown to the observer. Teardown failures lead with the resources
    /// already removed.
    pub fn observer_message(&self) -> String {
        match self {
            Self::Teardown(error) => {
                let mut lines = error.removed().to_vec();
                lines.push(error.to_string());
                lines.join("\n")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use sandbox_protocol::Action;

    use super::PipelineError;
    use crate::cluster::{ClusterError, ResourceKind};
    use crate::prober::ProbeError;
    use crate::rollout::RolloutError;
    use crate::teardown::TeardownError;

    #[test]
    fn container_startup_is_the_only_error_action() {
        let startup = PipelineError::from(RolloutError::ContainerStartup {
            container: "ci-fetcher".to_string(),
            logs: "curl: (6) Could not resolve host".to_string(),
        });
        assert_eq!(startup.action(), Action::Error);
        assert_eq!(startup.code(), "container_startup_failed");
        assert!(startup.observer_message().contains("Could not resolve host"));

        let not_found = PipelineError::from(RolloutError::PodNotFound {
            deployment: "x-prom".to_string(),
            reason: "timed out waiting for deployment x-prom to create a replica".to_string(),
        });
        assert!(not_found.observer_message().ends_with("to create a replica"));
        assert_eq!(not_found.action(), Action::Failure);
        let timeout = PipelineError::from(ProbeError::Cancelled);
        assert_eq!(timeout.action(), Action::Failure);
    }

    #[test]
    fn teardown_message_includes_prior_removals() {
        let error = PipelineError::from(TeardownError::Delete {
            kind: ResourceKind::Deployment,
            name: "abcdefgh-prom".to_string(),
            removed: vec!["Removed service abcdefgh".to_string()],
            source: ClusterError::Api {
                status: 403,
                message: "forbidden".to_string(),
            },
        });
        assert_eq!(error.action(), Action::Failure);
        assert_eq!(
            error.observer_message(),
            "Removed service abcdefgh\nerror removing deployment abcdefgh-prom: cluster api returned 403: forbidden"
        );
    }
}
