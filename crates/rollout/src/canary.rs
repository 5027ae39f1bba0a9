//! Canary: a parallel, separately scaled copy of the workload next to the untouched stable one.

use drover_apply::{mark_versioned, stamp_revision};
use drover_core::{labels, KubernetesResource, KubernetesResourceId, ReleaseStatus};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cleanup::sweep;
use crate::error::{Result, RolloutError};
use crate::instances::TargetInstances;
use crate::log::{run_phase, Phase};
use crate::pipeline::{self, retained_after_last_success, Rollout};
use crate::task::{TaskContext, TaskResult, TaskScope};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryDeployParams {
    pub manifests: String,
    pub instances: TargetInstances,
    /// Base for percentage targets; defaults to the stable workload's live replicas.
    #[serde(default)]
    pub max_instances: Option<i32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_dry_run: bool,
}

impl CanaryDeployParams {
    fn validate(&self) -> Result<()> {
        self.instances.validate()?;
        match self.max_instances {
            Some(n) if n < 0 => Err(RolloutError::Validation(format!("maxInstances must not be negative (got {})", n))),
            _ => Ok(()),
        }
    }
}

/// `<workload>-canary`, labelled and selected by the canary track.
fn canary_copy(stable: &KubernetesResource, replicas: i32) -> KubernetesResource {
    let mut canary = stable.clone();
    canary.set_name(&format!("{}-canary", stable.name()));
    canary.add_label(labels::TRACK, labels::TRACK_CANARY);
    canary.add_pod_template_label(labels::TRACK, labels::TRACK_CANARY);
    canary.add_selector_label(labels::TRACK, labels::TRACK_CANARY);
    canary.set_replicas(replicas);
    canary
}

async fn base_instances(ctx: &TaskContext, stable: &KubernetesResourceId, max_instances: Option<i32>) -> i32 {
    if let Some(n) = max_instances {
        return n;
    }
    match ctx.ops().current_replicas(stable).await {
        Ok(Some(n)) => n,
        Ok(None) => 1,
        Err(e) => {
            warn!(workload = %stable, error = %format!("{:#}", e), "replica lookup failed");
            ctx.sink().warn(
                Phase::Prepare,
                &format!("Could not read replicas of {}; assuming 1", stable.kind_name_ref()),
            );
            1
        }
    }
}

pub async fn run(ctx: &TaskContext, scope: &TaskScope, params: &CanaryDeployParams) -> Result<TaskResult> {
    params.validate()?;
    let Rollout { init, resources, managed, mut loaded } = pipeline::start(ctx, scope, &params.manifests).await?;
    let mut resources = resources;
    let outcome: Result<TaskResult> = async {
        pipeline::finish_init(ctx, init, &resources, params.skip_dry_run).await?;

        let history = &mut loaded.history;
        let (number, target, canary_id) = run_phase(ctx.sink(), Phase::Prepare, async {
            let stable = resources.remove(managed);
            let base = base_instances(ctx, &stable.id, params.max_instances).await;
            let target = params.instances.resolve(base);
            if params.instances.raised_to_minimum(base) {
                ctx.sink().info(Phase::Prepare, "Computed canary instances below 1; using 1");
            }
            ctx.sink().info(
                Phase::Prepare,
                &format!("Target canary instances: {} (base {}, stable {})", target, base, stable.id.kind_name_ref()),
            );
            resources.push(canary_copy(&stable, target));

            mark_versioned(&mut resources, false);
            let number = history.next_release_number();
            stamp_revision(&mut resources, number, true);
            let canary_id = resources
                .iter()
                .find(|r| r.is_managed_workload())
                .map(|r| r.id.clone())
                .ok_or_else(|| RolloutError::Versioning("canary workload missing after versioning".into()))?;
            let release = history.create_new_release(resources.iter().map(|r| r.id.clone()).collect());
            release.managed_workload = Some(canary_id.clone());
            release.target_replicas = Some(target);
            ctx.sink().info(Phase::Prepare, &format!("Current release number is: {}", number));
            ctx.sink().info(Phase::Prepare, &format!("Canary workload is {}", canary_id.kind_name_ref()));
            let retain = retained_after_last_success(history);
            sweep(ctx.ops(), ctx.sink(), Phase::Prepare, history, &retain).await;
            Ok((number, target, canary_id))
        })
        .await?;

        pipeline::apply_phase(ctx, &resources).await?;
        let revision = pipeline::wait_phase(ctx, &canary_id, ctx.config.timeout(params.timeout_secs)).await?;
        pipeline::wrap_up_phase(ctx, std::slice::from_ref(&canary_id)).await?;
        if let Some(release) = history.release_mut(number) {
            release.managed_workload_revision = revision;
            release.status = ReleaseStatus::Succeeded;
        }
        Ok(TaskResult::Canary { release_number: number, canary_workload: canary_id.name, target_instances: target })
    }
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canary_copy_is_renamed_labelled_and_sized() {
        let stable = KubernetesResource::from_value(
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": "web" },
                "spec": {
                    "replicas": 10,
                    "selector": { "matchLabels": { "app": "web" } },
                    "template": { "metadata": { "labels": { "app": "web" } } }
                }
            }),
            Some("prod"),
        )
        .unwrap();
        let canary = canary_copy(&stable, 3);
        assert_eq!(canary.name(), "web-canary");
        assert_eq!(canary.replicas(), Some(3));
        assert_eq!(canary.pod_template_labels().get(labels::TRACK).map(String::as_str), Some("canary"));
        assert_eq!(canary.value["spec"]["selector"]["matchLabels"]["drover.io/track"], "canary");
        assert_eq!(stable.replicas(), Some(10));
    }

    #[test]
    fn negative_max_instances_is_rejected() {
        let p = CanaryDeployParams {
            manifests: String::new(),
            instances: TargetInstances::percentage(50),
            max_instances: Some(-1),
            timeout_secs: None,
            skip_dry_run: false,
        };
        assert_eq!(p.validate().unwrap_err().kind(), "validation");
    }
}
