//! Drover Ops: the cluster operations a rollout drives.
//! `KubeOps` talks to a live cluster; `MockOps` records calls for tests.

#![forbid(unsafe_code)]

mod cluster;
mod mock;
pub mod status;

use anyhow::{anyhow, Result};
use drover_core::{KubernetesResource, KubernetesResourceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use cluster::KubeOps;
pub use mock::{MockOps, OpCall};
pub use status::{evaluate_rollout_status, RolloutStatus};

/// Process-style result of one operation: exit code plus captured output lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn ok(lines: Vec<String>) -> Self {
        Self { exit_code: 0, lines }
    }

    pub fn failed(lines: Vec<String>) -> Self {
        Self { exit_code: 1, lines }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// `spec.replicas` of a live object. Values outside `i32` are an error, not a truncation.
pub(crate) fn replicas_of(workload: &KubernetesResourceId, obj: &Json) -> Result<Option<i32>> {
    let Some(raw) = obj.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64()) else {
        return Ok(None);
    };
    i32::try_from(raw)
        .map(Some)
        .map_err(|_| anyhow!("{} reports {} replicas, outside the supported range", workload.kind_name_ref(), raw))
}

/// Cluster command executor contract.
///
/// `Err` means the operation could not be attempted (transport, discovery);
/// a non-zero `exit_code` means the cluster rejected it.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    async fn apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput>;

    /// Server-side validation without persisting anything.
    async fn dry_run_apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput>;

    async fn scale(&self, workload: &KubernetesResourceId, replicas: i32) -> Result<CommandOutput>;

    /// Roll a workload back to `to_revision`, or to the one before the current revision.
    async fn rollout_undo(&self, workload: &KubernetesResourceId, to_revision: Option<&str>) -> Result<CommandOutput>;

    async fn current_replicas(&self, workload: &KubernetesResourceId) -> Result<Option<i32>>;

    async fn latest_revision(&self, workload: &KubernetesResourceId) -> Result<Option<String>>;

    async fn rollout_status(&self, workload: &KubernetesResourceId) -> Result<RolloutStatus>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, id: &KubernetesResourceId) -> Result<CommandOutput>;

    async fn describe(&self, workload: &KubernetesResourceId) -> Result<CommandOutput>;

    /// Live object, if it exists.
    async fn get(&self, id: &KubernetesResourceId) -> Result<Option<Json>>;
}
