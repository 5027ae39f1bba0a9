use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use drover_apply::{apply_order, Applier};
use drover_core::{KubernetesResource, KubernetesResourceId};
use drover_kubehub::{get_kube_client, ApiResolver};
use k8s_openapi::api::apps::v1::{ControllerRevision, DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::status::{describe_lines, evaluate_rollout_status, RolloutStatus};
use crate::{ClusterOps, CommandOutput};

const DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";

/// Cluster operations over kube-rs, one object at a time.
pub struct KubeOps {
    applier: Applier,
}

impl KubeOps {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { applier: Applier::new(ApiResolver::new(client), field_manager) }
    }

    pub async fn connect(field_manager: impl Into<String>) -> Result<Self> {
        Ok(Self::new(get_kube_client().await?, field_manager))
    }

    fn client(&self) -> Client {
        self.applier.resolver().client().clone()
    }

    async fn api(&self, id: &KubernetesResourceId) -> Result<Api<DynamicObject>> {
        self.applier.resolver().api_for(id, None).await
    }

    async fn apply_all(&self, resources: &[KubernetesResource], dry_run: bool) -> CommandOutput {
        let mut lines = Vec::new();
        for r in apply_order(resources) {
            match self.applier.apply(r, dry_run).await {
                Ok(_) => lines.push(format!(
                    "{} {}",
                    r.id.kind_name_ref(),
                    if dry_run { "validated (server dry run)" } else { "serverside-applied" }
                )),
                Err(e) => {
                    lines.push(format!("{:#}", e));
                    return CommandOutput::failed(lines);
                }
            }
        }
        CommandOutput::ok(lines)
    }

    async fn undo_deployment(&self, ns: &str, name: &str, to_revision: Option<&str>) -> Result<CommandOutput> {
        let deployments: Api<Deployment> = Api::namespaced(self.client(), ns);
        let dep = deployments.get(name).await.with_context(|| format!("reading deployment {}/{}", ns, name))?;
        let current = revision_annotation(&dep.metadata).unwrap_or(0);
        let selector = dep.spec.as_ref().map(|s| label_selector(&s.selector)).unwrap_or_default();
        let uid = dep.metadata.uid.clone().unwrap_or_default();
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client(), ns);
        let owned: Vec<(i64, ReplicaSet)> = replica_sets
            .list(&ListParams::default().labels(&selector))
            .await
            .context("listing replica sets")?
            .items
            .into_iter()
            .filter(|rs| owned_by(&rs.metadata, &uid))
            .filter_map(|rs| revision_annotation(&rs.metadata).map(|r| (r, rs)))
            .collect();
        let Some((rev, rs)) = pick_revision(owned, current, to_revision) else {
            return Ok(CommandOutput::failed(vec![format!(
                "unable to find revision {} of deployment {:?}",
                to_revision.unwrap_or("previous"),
                name
            )]));
        };
        let mut template = serde_json::to_value(rs.spec.and_then(|s| s.template).unwrap_or_default())?;
        if let Some(lbls) = template.get_mut("metadata").and_then(|m| m.get_mut("labels")).and_then(|l| l.as_object_mut()) {
            lbls.remove("pod-template-hash");
        }
        if let Some(obj) = template.as_object_mut() {
            obj.insert("$patch".into(), Json::String("replace".into()));
        }
        let patch = serde_json::json!({ "spec": { "template": template } });
        deployments.patch(name, &PatchParams::default(), &Patch::Strategic(&patch)).await?;
        Ok(CommandOutput::ok(vec![format!("deployment.apps/{} rolled back to revision {}", name, rev)]))
    }

    async fn undo_from_controller_revisions(
        &self,
        id: &KubernetesResourceId,
        ns: &str,
        to_revision: Option<&str>,
    ) -> Result<CommandOutput> {
        let (uid, selector) = self.owner_selector(id, ns).await?;
        let owned = self.controller_revisions(ns, &uid, &selector).await?;
        let current = owned.iter().map(|(r, _)| *r).max().unwrap_or(0);
        let Some((rev, cr)) = pick_revision(owned, current, to_revision) else {
            return Ok(CommandOutput::failed(vec![format!(
                "unable to find revision {} of {}",
                to_revision.unwrap_or("previous"),
                id.kind_name_ref()
            )]));
        };
        let data = cr.data.map(|d| d.0).ok_or_else(|| anyhow!("controller revision {} has no data", rev))?;
        let api = self.api(id).await?;
        api.patch(&id.name, &PatchParams::default(), &Patch::Strategic(&data)).await?;
        Ok(CommandOutput::ok(vec![format!("{} rolled back to revision {}", id.kind_name_ref(), rev)]))
    }

    async fn owner_selector(&self, id: &KubernetesResourceId, ns: &str) -> Result<(String, String)> {
        match id.kind.as_str() {
            "StatefulSet" => {
                let sts = Api::<StatefulSet>::namespaced(self.client(), ns).get(&id.name).await?;
                let sel = sts.spec.as_ref().map(|s| label_selector(&s.selector)).unwrap_or_default();
                Ok((sts.metadata.uid.unwrap_or_default(), sel))
            }
            "DaemonSet" => {
                let ds = Api::<DaemonSet>::namespaced(self.client(), ns).get(&id.name).await?;
                let sel = ds.spec.as_ref().map(|s| label_selector(&s.selector)).unwrap_or_default();
                Ok((ds.metadata.uid.unwrap_or_default(), sel))
            }
            other => Err(anyhow!("rollout history not supported for kind {}", other)),
        }
    }

    async fn controller_revisions(&self, ns: &str, uid: &str, selector: &str) -> Result<Vec<(i64, ControllerRevision)>> {
        let api: Api<ControllerRevision> = Api::namespaced(self.client(), ns);
        Ok(api
            .list(&ListParams::default().labels(selector))
            .await
            .context("listing controller revisions")?
            .items
            .into_iter()
            .filter(|cr| owned_by(&cr.metadata, uid))
            .map(|cr| (cr.revision, cr))
            .collect())
    }
}

fn label_selector(sel: &LabelSelector) -> String {
    sel.match_labels
        .as_ref()
        .map(|m: &BTreeMap<String, String>| m.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
        .unwrap_or_default()
}

fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references.as_ref().map(|refs| refs.iter().any(|o| o.uid == uid)).unwrap_or(false)
}

fn revision_annotation(meta: &ObjectMeta) -> Option<i64> {
    meta.annotations.as_ref().and_then(|a| a.get(DEPLOYMENT_REVISION)).and_then(|v| v.parse().ok())
}

/// The requested revision, or the newest one older than `current`.
fn pick_revision<T>(candidates: Vec<(i64, T)>, current: i64, to_revision: Option<&str>) -> Option<(i64, T)> {
    match to_revision.and_then(|r| r.parse::<i64>().ok()) {
        Some(want) => candidates.into_iter().find(|(r, _)| *r == want),
        None => candidates.into_iter().filter(|(r, _)| *r < current).max_by_key(|(r, _)| *r),
    }
}

fn record(op: &'static str, out: &Result<CommandOutput>) {
    counter!("cluster_op_total", 1u64, "op" => op);
    if !matches!(out, Ok(o) if o.is_success()) {
        counter!("cluster_op_failed_total", 1u64, "op" => op);
    }
}

#[async_trait::async_trait]
impl ClusterOps for KubeOps {
    async fn apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput> {
        let out = Ok(self.apply_all(resources, false).await);
        record("apply", &out);
        out
    }

    async fn dry_run_apply(&self, resources: &[KubernetesResource]) -> Result<CommandOutput> {
        let out = Ok(self.apply_all(resources, true).await);
        record("dry_run", &out);
        out
    }

    async fn scale(&self, workload: &KubernetesResourceId, replicas: i32) -> Result<CommandOutput> {
        let api = self.api(workload).await?;
        let payload = serde_json::json!({ "spec": { "replicas": replicas } });
        let pp = PatchParams::default();
        let done = match api.patch_scale(&workload.name, &pp, &Patch::Merge(&payload)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, workload = %workload, "patch_scale failed; falling back to spec.replicas");
                api.patch(&workload.name, &pp, &Patch::Merge(&payload)).await.map(|_| ())
            }
        };
        let out = Ok(match done {
            Ok(()) => CommandOutput::ok(vec![format!("{} scaled to {}", workload.kind_name_ref(), replicas)]),
            Err(e) => CommandOutput::failed(vec![format!("scaling {} failed: {}", workload.kind_name_ref(), e)]),
        });
        record("scale", &out);
        out
    }

    async fn rollout_undo(&self, workload: &KubernetesResourceId, to_revision: Option<&str>) -> Result<CommandOutput> {
        let ns = workload.namespace.as_deref().ok_or_else(|| anyhow!("namespace required for rollout undo"))?;
        info!(workload = %workload, to_revision = ?to_revision, "rollout undo");
        let out = match workload.kind.as_str() {
            "Deployment" => self.undo_deployment(ns, &workload.name, to_revision).await,
            "StatefulSet" | "DaemonSet" => self.undo_from_controller_revisions(workload, ns, to_revision).await,
            other => Ok(CommandOutput::failed(vec![format!("rollout undo is not supported for kind {}", other)])),
        };
        record("rollout_undo", &out);
        out
    }

    async fn current_replicas(&self, workload: &KubernetesResourceId) -> Result<Option<i32>> {
        match self.get(workload).await? {
            Some(obj) => crate::replicas_of(workload, &obj),
            None => Ok(None),
        }
    }

    async fn latest_revision(&self, workload: &KubernetesResourceId) -> Result<Option<String>> {
        let ns = workload.namespace.as_deref().ok_or_else(|| anyhow!("namespace required for revision lookup"))?;
        match workload.kind.as_str() {
            "Deployment" => {
                let dep = Api::<Deployment>::namespaced(self.client(), ns).get_opt(&workload.name).await?;
                Ok(dep.and_then(|d| revision_annotation(&d.metadata)).map(|r| r.to_string()))
            }
            "StatefulSet" | "DaemonSet" => {
                let (uid, selector) = self.owner_selector(workload, ns).await?;
                let owned = self.controller_revisions(ns, &uid, &selector).await?;
                Ok(owned.iter().map(|(r, _)| *r).max().map(|r| r.to_string()))
            }
            _ => Ok(None),
        }
    }

    async fn rollout_status(&self, workload: &KubernetesResourceId) -> Result<RolloutStatus> {
        Ok(match self.get(workload).await? {
            Some(obj) => evaluate_rollout_status(&workload.kind, &obj),
            None => RolloutStatus::Failed(format!("{} not found", workload.kind_name_ref())),
        })
    }

    async fn delete(&self, id: &KubernetesResourceId) -> Result<CommandOutput> {
        let api = self.api(id).await?;
        let out = Ok(match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => CommandOutput::ok(vec![format!("{} deleted", id.kind_name_ref())]),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                CommandOutput::ok(vec![format!("{} not found; nothing to delete", id.kind_name_ref())])
            }
            Err(e) => CommandOutput::failed(vec![format!("deleting {} failed: {}", id.kind_name_ref(), e)]),
        });
        record("delete", &out);
        out
    }

    async fn describe(&self, workload: &KubernetesResourceId) -> Result<CommandOutput> {
        Ok(match self.get(workload).await? {
            Some(obj) => CommandOutput::ok(describe_lines(&workload.kind, &obj)),
            None => CommandOutput::failed(vec![format!("{} not found", workload.kind_name_ref())]),
        })
    }

    async fn get(&self, id: &KubernetesResourceId) -> Result<Option<Json>> {
        let api = self.api(id).await?;
        let obj = api.get_opt(&id.name).await.with_context(|| format!("reading {}", id))?;
        obj.map(|o| serde_json::to_value(o).context("serializing DynamicObject")).transpose()
    }
}
