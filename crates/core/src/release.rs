//! Release records and the append-only history they live in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::KubernetesResourceId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReleaseStatus {
    InProgress,
    Succeeded,
    Failed,
    RollbackSucceeded,
    RollbackFailed,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::InProgress => "InProgress",
            ReleaseStatus::Succeeded => "Succeeded",
            ReleaseStatus::Failed => "Failed",
            ReleaseStatus::RollbackSucceeded => "RollbackSucceeded",
            ReleaseStatus::RollbackFailed => "RollbackFailed",
        };
        f.write_str(s)
    }
}

/// One rollout attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub number: u32,
    pub status: ReleaseStatus,
    #[serde(default)]
    pub resources: Vec<KubernetesResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_workload: Option<KubernetesResourceId>,
    /// Cluster-observed revision of the managed workload once it converged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_workload_revision: Option<String>,
    /// Replica count the managed workload was scaled to (canary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_replicas: Option<i32>,
    /// Seconds since epoch.
    #[serde(default)]
    pub created_at: i64,
}

impl Release {
    pub fn is_rollback_eligible(&self) -> bool {
        self.status == ReleaseStatus::Succeeded && !self.resources.is_empty()
    }

    pub fn versioned_resources(&self) -> impl Iterator<Item = &KubernetesResourceId> {
        self.resources.iter().filter(|r| r.versioned)
    }
}

/// Ordered releases for one (namespace, release name) scope, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseHistory {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub releases: Vec<Release>,
}

fn default_version() -> String {
    "v1".to_string()
}

impl Default for ReleaseHistory {
    fn default() -> Self {
        Self { version: default_version(), releases: Vec::new() }
    }
}

impl ReleaseHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Restore ascending number order after loading a document written by another tool.
    pub fn normalize(&mut self) {
        self.releases.sort_by_key(|r| r.number);
    }

    /// Previous max + 1, or 1 for an empty history.
    pub fn next_release_number(&self) -> u32 {
        self.releases.iter().map(|r| r.number).max().unwrap_or(0) + 1
    }

    /// Append the next release in `InProgress`.
    pub fn create_new_release(&mut self, resources: Vec<KubernetesResourceId>) -> &mut Release {
        let number = self.next_release_number();
        self.releases.push(Release {
            number,
            status: ReleaseStatus::InProgress,
            resources,
            managed_workload: None,
            managed_workload_revision: None,
            target_replicas: None,
            created_at: chrono::Utc::now().timestamp(),
        });
        let last = self.releases.len() - 1;
        &mut self.releases[last]
    }

    pub fn latest_release(&self) -> Option<&Release> {
        self.releases.iter().max_by_key(|r| r.number)
    }

    pub fn release(&self, number: u32) -> Option<&Release> {
        self.releases.iter().find(|r| r.number == number)
    }

    pub fn release_mut(&mut self, number: u32) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.number == number)
    }

    /// Most recent release numbered below `before` that can be restored.
    pub fn previous_rollback_eligible_release(&self, before: u32) -> Option<&Release> {
        self.releases
            .iter()
            .filter(|r| r.number < before && r.is_rollback_eligible())
            .max_by_key(|r| r.number)
    }

    pub fn previous_successful_release(&self, before: u32) -> Option<&Release> {
        self.releases
            .iter()
            .filter(|r| r.number < before && r.status == ReleaseStatus::Succeeded)
            .max_by_key(|r| r.number)
    }

    pub fn last_successful_release(&self) -> Option<&Release> {
        self.previous_successful_release(u32::MAX)
    }

    /// Releases newest first.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &Release> {
        self.releases.iter().rev()
    }

    pub fn retain(&mut self, keep: impl FnMut(&Release) -> bool) {
        self.releases.retain(keep);
    }
}
