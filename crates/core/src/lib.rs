//! Drover core types: resource identities, releases and the release history ledger.

#![forbid(unsafe_code)]

pub mod release;
pub mod resource;

pub use release::{Release, ReleaseHistory, ReleaseStatus};
pub use resource::{deletion_order, kind_rank, KubernetesResource, KubernetesResourceId};

/// Labels stamped onto objects by rollouts.
pub mod labels {
    /// Release revision carried by pod templates, workload selectors and service selectors.
    pub const REVISION: &str = "drover.io/revision";
    /// Canary track; only the canary copy carries it.
    pub const TRACK: &str = "drover.io/track";
    pub const TRACK_CANARY: &str = "canary";
    pub const RELEASE_NAME: &str = "drover.io/release-name";
    pub const RELEASE_HISTORY: &str = "drover.io/release-history";
}

/// Annotations read from manifests.
pub mod annotations {
    /// Marks an extra workload as directly applied (not managed by the strategy).
    pub const DIRECT_APPLY: &str = "drover.io/direct-apply";
    pub const PRIMARY_SERVICE: &str = "drover.io/primary-service";
    pub const STAGE_SERVICE: &str = "drover.io/stage-service";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("manifest document is not an object")]
    NotAnObject,
    #[error("manifest missing {0}")]
    MissingField(&'static str),
    #[error("invalid resource reference: {0} (expect Kind/name or namespace/Kind/name)")]
    InvalidReference(String),
}

pub mod prelude {
    pub use super::{
        annotations, labels, KubernetesResource, KubernetesResourceId, Release, ReleaseHistory, ReleaseStatus,
    };
}
