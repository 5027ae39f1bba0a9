use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// Bad task parameters or manifests; raised before any cluster mutation.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("release history unavailable: {0:#}")]
    Persistence(anyhow::Error),
    #[error("release history conflict: {0}")]
    Conflict(String),
    #[error("dry run failed: {0}")]
    DryRun(String),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("{workload} did not reach steady state within {timeout_secs}s")]
    SteadyStateTimeout { workload: String, timeout_secs: u64 },
    #[error("{workload} rollout failed: {reason}")]
    WorkloadFailed { workload: String, reason: String },
    #[error("{0}")]
    Versioning(String),
    #[error("traffic routing: {0}")]
    TrafficRouting(String),
    #[error("cluster operation failed: {0:#}")]
    Cluster(anyhow::Error),
}

impl RolloutError {
    pub fn kind(&self) -> &'static str {
        match self {
            RolloutError::Validation(_) => "validation",
            RolloutError::Persistence(_) => "persistence",
            RolloutError::Conflict(_) => "conflict",
            RolloutError::DryRun(_) => "dry_run",
            RolloutError::Apply(_) => "apply",
            RolloutError::SteadyStateTimeout { .. } => "steady_state_timeout",
            RolloutError::WorkloadFailed { .. } => "workload_failed",
            RolloutError::Versioning(_) => "versioning",
            RolloutError::TrafficRouting(_) => "traffic_routing",
            RolloutError::Cluster(_) => "cluster",
        }
    }
}

pub type Result<T, E = RolloutError> = std::result::Result<T, E>;
