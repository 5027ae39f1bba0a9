//! Blue-green: each release gets its own workload; a primary and a stage Service select
//! between revisions, and promotion swaps them.

use drover_apply::{mark_versioned, stamp_revision, strip_noisy};
use drover_core::{labels, KubernetesResource, KubernetesResourceId, ReleaseHistory, ReleaseStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cleanup::sweep;
use crate::error::{Result, RolloutError};
use crate::log::{run_phase, Phase};
use crate::pipeline::{self, Rollout};
use crate::task::{TaskContext, TaskResult, TaskScope};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenDeployParams {
    pub manifests: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_dry_run: bool,
}

/// Services to swap. Unnamed ones are found through their annotations among the
/// latest release's Services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapParams {
    #[serde(default)]
    pub primary_service: Option<String>,
    #[serde(default)]
    pub stage_service: Option<String>,
}

/// Revision a Service currently selects, if any.
pub(crate) fn selected_revision(service: &KubernetesResource) -> Option<String> {
    service.service_selector().get(labels::REVISION).cloned()
}

pub(crate) async fn live_resource(
    ctx: &TaskContext,
    id: &KubernetesResourceId,
) -> Result<Option<KubernetesResource>> {
    let Some(value) = ctx.ops().get(id).await.map_err(RolloutError::Cluster)? else {
        return Ok(None);
    };
    KubernetesResource::from_value(value, id.namespace.as_deref())
        .map(Some)
        .map_err(|e| RolloutError::Cluster(anyhow::Error::new(e).context(format!("reading live {}", id.kind_name_ref()))))
}

async fn require_live(ctx: &TaskContext, id: &KubernetesResourceId) -> Result<KubernetesResource> {
    live_resource(ctx, id)
        .await?
        .ok_or_else(|| RolloutError::Validation(format!("{} not found in the cluster", id.kind_name_ref())))
}

/// Primary and stage Service ids recorded in the latest release, told apart by the
/// annotations on their live objects.
pub(crate) async fn discover_services(
    ctx: &TaskContext,
    history: &ReleaseHistory,
) -> Result<(KubernetesResourceId, KubernetesResourceId)> {
    let candidates: Vec<KubernetesResourceId> = history
        .latest_release()
        .map(|r| r.resources.iter().filter(|id| id.kind == drover_core::resource::SERVICE_KIND).cloned().collect())
        .unwrap_or_default();
    let (mut primary, mut stage) = (None, None);
    for id in candidates {
        if let Some(live) = live_resource(ctx, &id).await? {
            if live.is_primary_service() {
                primary = Some(id);
            } else if live.is_stage_service() {
                stage = Some(id);
            }
        }
    }
    match (primary, stage) {
        (Some(p), Some(s)) => Ok((p, s)),
        (None, _) => Err(RolloutError::Validation("no primary service found in the latest release".into())),
        (_, None) => Err(RolloutError::Validation("no stage service found in the latest release".into())),
    }
}

/// Point the live primary and stage Services at new revisions and apply them.
pub(crate) async fn repoint_services(
    ctx: &TaskContext,
    phase: Phase,
    mut primary: KubernetesResource,
    primary_revision: &str,
    mut stage: KubernetesResource,
    stage_revision: &str,
) -> Result<()> {
    primary.set_service_selector_label(labels::REVISION, primary_revision);
    stage.set_service_selector_label(labels::REVISION, stage_revision);
    primary.value = strip_noisy(primary.value);
    stage.value = strip_noisy(stage.value);
    ctx.sink().info(
        phase,
        &format!(
            "Pointing {} at revision {} and {} at revision {}",
            primary.id.kind_name_ref(),
            primary_revision,
            stage.id.kind_name_ref(),
            stage_revision
        ),
    );
    let out = ctx.ops().apply(&[primary, stage]).await.map_err(RolloutError::Cluster)?;
    for line in &out.lines {
        ctx.sink().info(phase, line);
    }
    if !out.is_success() {
        return Err(RolloutError::Apply(out.text()));
    }
    Ok(())
}

fn service_index(resources: &[KubernetesResource], primary: bool) -> Result<usize> {
    let found: Vec<usize> = resources
        .iter()
        .enumerate()
        .filter(|(_, r)| if primary { r.is_primary_service() } else { r.is_stage_service() })
        .map(|(i, _)| i)
        .collect();
    let (role, key) = if primary {
        ("primary", drover_core::annotations::PRIMARY_SERVICE)
    } else {
        ("stage", drover_core::annotations::STAGE_SERVICE)
    };
    match found.as_slice() {
        [one] => Ok(*one),
        [] => Err(RolloutError::Validation(format!(
            "no {} service found in manifests; annotate exactly one Service with {}: \"true\"",
            role, key
        ))),
        _ => Err(RolloutError::Validation(format!("more than one Service annotated with {}", key))),
    }
}

/// Primary stays on the live revision unless this is the first release or nothing is live yet.
pub(crate) fn primary_target(number: u32, live_primary: Option<&str>) -> String {
    match live_primary {
        Some(rev) if number != 1 => rev.to_string(),
        _ => number.to_string(),
    }
}

pub async fn run(ctx: &TaskContext, scope: &TaskScope, params: &BlueGreenDeployParams) -> Result<TaskResult> {
    let Rollout { init, mut resources, managed, mut loaded } =
        pipeline::start(ctx, scope, &params.manifests).await?;
    let outcome: Result<TaskResult> = async {
        let (primary_idx, stage_idx) = match (service_index(&resources, true), service_index(&resources, false)) {
            (Ok(p), Ok(s)) => (p, s),
            (Err(e), _) | (_, Err(e)) => return Err(init.fail(e)),
        };
        pipeline::finish_init(ctx, init, &resources, params.skip_dry_run).await?;

        let history = &mut loaded.history;
        let (number, primary_revision, workload) = run_phase(ctx.sink(), Phase::Prepare, async {
            let live_primary = live_resource(ctx, &resources[primary_idx].id).await?.as_ref().and_then(selected_revision);
            let live_stage = live_resource(ctx, &resources[stage_idx].id).await?.as_ref().and_then(selected_revision);
            ctx.sink().info(
                Phase::Prepare,
                &format!(
                    "Primary service is at revision {}; stage service is at revision {}",
                    live_primary.as_deref().unwrap_or("none"),
                    live_stage.as_deref().unwrap_or("none")
                ),
            );

            mark_versioned(&mut resources, false);
            let number = history.next_release_number();
            stamp_revision(&mut resources, number, true);
            let primary_revision = primary_target(number, live_primary.as_deref());
            let stage_revision = number.to_string();
            resources[primary_idx].set_service_selector_label(labels::REVISION, &primary_revision);
            resources[stage_idx].set_service_selector_label(labels::REVISION, &stage_revision);

            let workload = resources[managed].id.clone();
            let release = history.create_new_release(resources.iter().map(|r| r.id.clone()).collect());
            release.managed_workload = Some(workload.clone());
            ctx.sink().info(Phase::Prepare, &format!("Current release number is: {}", number));
            ctx.sink().info(
                Phase::Prepare,
                &format!("Primary service -> revision {}, stage service -> revision {}", primary_revision, stage_revision),
            );

            let mut retain = vec![number];
            if let Some(n) = primary_revision.parse::<u32>().ok().filter(|n| *n != number) {
                retain.push(n);
            }
            sweep(ctx.ops(), ctx.sink(), Phase::Prepare, history, &retain).await;
            Ok((number, primary_revision, workload))
        })
        .await?;

        pipeline::apply_phase(ctx, &resources).await?;
        let revision = pipeline::wait_phase(ctx, &workload, ctx.config.timeout(params.timeout_secs)).await?;
        pipeline::wrap_up_phase(ctx, std::slice::from_ref(&workload)).await?;
        if let Some(release) = history.release_mut(number) {
            release.managed_workload_revision = revision;
            release.status = ReleaseStatus::Succeeded;
        }
        Ok(TaskResult::BlueGreen {
            release_number: number,
            managed_workload: workload.name,
            primary_revision,
            stage_revision: number.to_string(),
        })
    }
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}

/// Promote stage to primary by exchanging the two Services' revision selectors.
pub async fn swap(ctx: &TaskContext, scope: &TaskScope, params: &SwapParams) -> Result<TaskResult> {
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let outcome = run_phase(ctx.sink(), Phase::SwapServices, async {
        let (primary_id, stage_id) = match (&params.primary_service, &params.stage_service) {
            (Some(p), Some(s)) => (
                KubernetesResourceId::new(drover_core::resource::SERVICE_KIND, p.as_str(), Some(&scope.namespace)),
                KubernetesResourceId::new(drover_core::resource::SERVICE_KIND, s.as_str(), Some(&scope.namespace)),
            ),
            _ => discover_services(ctx, &loaded.history).await?,
        };
        let primary = require_live(ctx, &primary_id).await?;
        let stage = require_live(ctx, &stage_id).await?;
        let no_revision = |id: &KubernetesResourceId| {
            RolloutError::Validation(format!("{} has no {} selector", id.kind_name_ref(), labels::REVISION))
        };
        let primary_rev = selected_revision(&primary).ok_or_else(|| no_revision(&primary_id))?;
        let stage_rev = selected_revision(&stage).ok_or_else(|| no_revision(&stage_id))?;
        if primary_rev == stage_rev {
            ctx.sink().info(
                Phase::SwapServices,
                &format!("Both services already point at revision {}; nothing to swap", primary_rev),
            );
            return Ok(TaskResult::Swap { primary_revision: primary_rev, stage_revision: stage_rev });
        }
        repoint_services(ctx, Phase::SwapServices, primary, &stage_rev, stage, &primary_rev).await?;
        info!(primary = %stage_rev, stage = %primary_rev, "services swapped");
        Ok(TaskResult::Swap { primary_revision: stage_rev, stage_revision: primary_rev })
    })
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}
