use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use drover_core::{KubernetesResource, KubernetesResourceId};
use serde_json::Value as Json;

use crate::status::{describe_lines, RolloutStatus};
use crate::{ClusterOps, CommandOutput};

/// One recorded call on [`MockOps`].
#[derive(Debug, Clone, PartialEq)]
pub enum OpCall {
    DryRun(Vec<KubernetesResourceId>),
    Apply(Vec<KubernetesResourceId>),
    Scale(KubernetesResourceId, i32),
    RolloutUndo(KubernetesResourceId, Option<String>),
    Delete(KubernetesResourceId),
    Describe(KubernetesResourceId),
    Get(KubernetesResourceId),
    CurrentReplicas(KubernetesResourceId),
    LatestRevision(KubernetesResourceId),
    RolloutStatus(KubernetesResourceId),
}

impl OpCall {
    /// Apply, scale, rollout undo and delete change the cluster; the rest only read.
    pub fn is_mutation(&self) -> bool {
        matches!(self, OpCall::Apply(_) | OpCall::Scale(..) | OpCall::RolloutUndo(..) | OpCall::Delete(_))
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<OpCall>,
    live: HashMap<String, Json>,
    revisions: HashMap<String, String>,
    statuses: HashMap<String, VecDeque<RolloutStatus>>,
    fail_apply: bool,
    fail_dry_run: bool,
    fail_scale: bool,
    fail_undo: bool,
    fail_delete: HashSet<String>,
}

fn key(id: &KubernetesResourceId) -> String {
    format!("{}/{}/{}", id.namespace.as_deref().unwrap_or(""), id.kind, id.name)
}

/// In-memory cluster for tests: records every call, keeps applied objects,
/// and fails operations on request.
#[derive(Default)]
pub struct MockOps {
    state: Mutex<MockState>,
}

impl MockOps {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_apply(&self) -> &Self {
        self.lock().fail_apply = true;
        self
    }

    pub fn fail_dry_run(&self) -> &Self {
        self.lock().fail_dry_run = true;
        self
    }

    pub fn fail_scale(&self) -> &Self {
        self.lock().fail_scale = true;
        self
    }

    pub fn fail_undo(&self) -> &Self {
        self.lock().fail_undo = true;
        self
    }

    /// Deletes of objects with this name fail.
    pub fn fail_delete(&self, name: &str) -> &Self {
        self.lock().fail_delete.insert(name.to_string());
        self
    }

    /// Clear the scripted failures, keeping live objects and recorded calls.
    pub fn heal(&self) -> &Self {
        let mut s = self.lock();
        s.fail_apply = false;
        s.fail_dry_run = false;
        s.fail_scale = false;
        s.fail_undo = false;
        s.fail_delete.clear();
        self
    }

    /// Seed a live object.
    pub fn put_live(&self, res: &KubernetesResource) -> &Self {
        self.lock().live.insert(key(&res.id), res.value.clone());
        self
    }

    /// Revision reported by `latest_revision`; unset workloads report none.
    pub fn set_revision(&self, id: &KubernetesResourceId, revision: &str) -> &Self {
        self.lock().revisions.insert(key(id), revision.to_string());
        self
    }

    /// Statuses returned by successive polls; the last one repeats. Unscripted workloads converge.
    pub fn script_status(&self, id: &KubernetesResourceId, statuses: Vec<RolloutStatus>) -> &Self {
        self.lock().statuses.insert(key(id), statuses.into());
        self
    }

    pub fn calls(&self) -> Vec<OpCall> {
        self.lock().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn deleted(&self) -> Vec<KubernetesResourceId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                OpCall::Delete(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn scaled(&self) -> Vec<(KubernetesResourceId, i32)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                OpCall::Scale(id, n) => Some((id.clone(), *n)),
                _ => None,
            })
            .collect()
    }

    pub fn live(&self, id: &KubernetesResourceId) -> Option<Json> {
        self.lock().live.get(&key(id)).cloned()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

fn ids(resources: &[KubernetesResource]) -> Vec<KubernetesResourceId> {
    resources.iter().map(|r| r.id.clone()).collect()
}

#[async_trait::async_trait]
impl ClusterOps for MockOps {
    async fn apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::Apply(ids(resources)));
        if s.fail_apply {
            return Ok(CommandOutput::failed(vec!["error: admission webhook denied the request".into()]));
        }
        let mut lines = Vec::new();
        for r in resources {
            s.live.insert(key(&r.id), r.value.clone());
            lines.push(format!("{} configured", r.id.kind_name_ref()));
        }
        Ok(CommandOutput::ok(lines))
    }

    async fn dry_run_apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::DryRun(ids(resources)));
        if s.fail_dry_run {
            return Ok(CommandOutput::failed(vec!["error: invalid manifest (dry run)".into()]));
        }
        Ok(CommandOutput::ok(resources.iter().map(|r| format!("{} (dry run)", r.id.kind_name_ref())).collect()))
    }

    async fn scale(&self, workload: &KubernetesResourceId, replicas: i32) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::Scale(workload.clone(), replicas));
        if s.fail_scale {
            return Ok(CommandOutput::failed(vec![format!("scaling {} failed", workload.kind_name_ref())]));
        }
        if let Some(obj) = s.live.get_mut(&key(workload)) {
            drover_core::resource::object_at(obj, &["spec"]).insert("replicas".into(), Json::from(replicas));
        }
        Ok(CommandOutput::ok(vec![format!("{} scaled", workload.kind_name_ref())]))
    }

    async fn rollout_undo(&self, workload: &KubernetesResourceId, to_revision: Option<&str>) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::RolloutUndo(workload.clone(), to_revision.map(|r| r.to_string())));
        if s.fail_undo {
            return Ok(CommandOutput::failed(vec![format!("unable to roll back {}", workload.kind_name_ref())]));
        }
        if let Some(rev) = to_revision {
            s.revisions.insert(key(workload), rev.to_string());
        }
        Ok(CommandOutput::ok(vec![format!("{} rolled back", workload.kind_name_ref())]))
    }

    async fn current_replicas(&self, workload: &KubernetesResourceId) -> Result<Option<i32>> {
        let mut s = self.lock();
        s.calls.push(OpCall::CurrentReplicas(workload.clone()));
        match s.live.get(&key(workload)) {
            Some(obj) => crate::replicas_of(workload, obj),
            None => Ok(None),
        }
    }

    async fn latest_revision(&self, workload: &KubernetesResourceId) -> Result<Option<String>> {
        let mut s = self.lock();
        s.calls.push(OpCall::LatestRevision(workload.clone()));
        Ok(s.revisions.get(&key(workload)).cloned())
    }

    async fn rollout_status(&self, workload: &KubernetesResourceId) -> Result<RolloutStatus> {
        let mut s = self.lock();
        s.calls.push(OpCall::RolloutStatus(workload.clone()));
        let converged = RolloutStatus::Converged(format!("{} successfully rolled out", workload.kind_name_ref()));
        Ok(match s.statuses.get_mut(&key(workload)) {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or(converged),
            Some(q) => q.front().cloned().unwrap_or(converged),
            None => converged,
        })
    }

    async fn delete(&self, id: &KubernetesResourceId) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::Delete(id.clone()));
        if s.fail_delete.contains(&id.name) {
            return Ok(CommandOutput::failed(vec![format!("error: deleting {} is forbidden", id.kind_name_ref())]));
        }
        s.live.remove(&key(id));
        Ok(CommandOutput::ok(vec![format!("{} deleted", id.kind_name_ref())]))
    }

    async fn describe(&self, workload: &KubernetesResourceId) -> Result<CommandOutput> {
        let mut s = self.lock();
        s.calls.push(OpCall::Describe(workload.clone()));
        Ok(match s.live.get(&key(workload)) {
            Some(obj) => CommandOutput::ok(describe_lines(&workload.kind, obj)),
            None => CommandOutput::failed(vec![format!("{} not found", workload.kind_name_ref())]),
        })
    }

    async fn get(&self, id: &KubernetesResourceId) -> Result<Option<Json>> {
        let mut s = self.lock();
        s.calls.push(OpCall::Get(id.clone()));
        Ok(s.live.get(&key(id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str) -> KubernetesResource {
        KubernetesResource::from_value(
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": name },
                "spec": { "replicas": 2 }
            }),
            Some("prod"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn apply_then_scale_updates_live_object() {
        let ops = MockOps::new();
        let web = deployment("web");
        ops.apply(std::slice::from_ref(&web)).await.unwrap();
        assert_eq!(ops.current_replicas(&web.id).await.unwrap(), Some(2));
        ops.scale(&web.id, 5).await.unwrap();
        assert_eq!(ops.current_replicas(&web.id).await.unwrap(), Some(5));
        assert_eq!(ops.scaled(), vec![(web.id.clone(), 5)]);
        assert_eq!(ops.mutation_count(), 2);
    }

    #[tokio::test]
    async fn scripted_status_repeats_last() {
        let ops = MockOps::new();
        let id = deployment("web").id;
        ops.script_status(&id, vec![RolloutStatus::Progressing("1/2".into()), RolloutStatus::Failed("boom".into())]);
        assert!(matches!(ops.rollout_status(&id).await.unwrap(), RolloutStatus::Progressing(_)));
        assert!(matches!(ops.rollout_status(&id).await.unwrap(), RolloutStatus::Failed(_)));
        assert!(matches!(ops.rollout_status(&id).await.unwrap(), RolloutStatus::Failed(_)));
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_exit_codes() {
        let ops = MockOps::new();
        let web = deployment("web");
        ops.fail_apply().fail_delete("web");
        assert!(!ops.apply(std::slice::from_ref(&web)).await.unwrap().is_success());
        assert!(!ops.delete(&web.id).await.unwrap().is_success());
        ops.heal();
        assert!(ops.apply(std::slice::from_ref(&web)).await.unwrap().is_success());
        assert!(ops.live(&web.id).is_some());
    }

    #[tokio::test]
    async fn revisions_are_reported_only_once_set() {
        let ops = MockOps::new();
        let web = deployment("web");
        ops.apply(std::slice::from_ref(&web)).await.unwrap();
        assert_eq!(ops.latest_revision(&web.id).await.unwrap(), None);
        ops.set_revision(&web.id, "4");
        assert_eq!(ops.latest_revision(&web.id).await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn out_of_range_replicas_are_an_error() {
        let ops = MockOps::new();
        let mut web = deployment("web");
        web.value["spec"]["replicas"] = serde_json::json!(i64::from(i32::MAX) + 1);
        ops.put_live(&web);
        assert!(ops.current_replicas(&web.id).await.is_err());
    }
}
