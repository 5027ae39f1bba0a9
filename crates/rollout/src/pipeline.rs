//! Phases shared by the deploy strategies, and the single ledger commit that ends a task.

use std::time::Duration;

use drover_apply::{apply_order, find_managed_workload, parse_manifests};
use drover_core::{KubernetesResource, KubernetesResourceId, ReleaseHistory, ReleaseStatus};
use tracing::{error, warn};

use crate::error::{Result, RolloutError};
use crate::ledger::LoadedHistory;
use crate::log::{run_phase, Phase, PhaseLog};
use crate::steady::wait_for_steady_state;
use crate::task::{TaskContext, TaskScope};

/// State carried from Init into the later phases of a deploy.
pub(crate) struct Rollout<'a> {
    pub init: PhaseLog<'a>,
    pub resources: Vec<KubernetesResource>,
    /// Index of the managed workload in `resources`.
    pub managed: usize,
    pub loaded: LoadedHistory,
}

/// Open Init: parse the manifests, pick the managed workload, then load the ledger.
/// Errors here happen before the ledger is read, so nothing is saved for them.
pub(crate) async fn start<'a>(ctx: &'a TaskContext, scope: &TaskScope, manifests: &str) -> Result<Rollout<'a>> {
    let init = PhaseLog::begin(ctx.sink(), Phase::Init);
    let resources = match parse_manifests(manifests, Some(&scope.namespace)) {
        Ok(r) => r,
        Err(e) => return Err(init.fail(RolloutError::Validation(format!("{:#}", e)))),
    };
    for r in &resources {
        ctx.sink().info(Phase::Init, &format!("Found {}", r.id.kind_name_ref()));
    }
    let managed = match find_managed_workload(&resources) {
        Ok(i) => i,
        Err(e) => return Err(init.fail(RolloutError::Versioning(format!("{:#}", e)))),
    };
    ctx.sink().info(Phase::Init, &format!("Managed workload is {}", resources[managed].id.kind_name_ref()));
    let loaded = match ctx.ledger.load(&scope.key()).await {
        Ok(l) => l,
        Err(e) => return Err(init.fail(e)),
    };
    Ok(Rollout { init, resources, managed, loaded })
}

/// Close Init with a server-side dry run of the raw manifests.
pub(crate) async fn finish_init(
    ctx: &TaskContext,
    init: PhaseLog<'_>,
    resources: &[KubernetesResource],
    skip_dry_run: bool,
) -> Result<()> {
    if skip_dry_run {
        ctx.sink().info(Phase::Init, "Skipping dry run");
        init.succeed("Done.");
        return Ok(());
    }
    ctx.sink().info(Phase::Init, "Validating manifests with a dry run");
    match ctx.ops().dry_run_apply(resources).await {
        Ok(out) if out.is_success() => {
            for line in &out.lines {
                ctx.sink().info(Phase::Init, line);
            }
            init.succeed("Done.");
            Ok(())
        }
        Ok(out) => Err(init.fail(RolloutError::DryRun(out.text()))),
        Err(e) => Err(init.fail(RolloutError::Cluster(e))),
    }
}

/// Releases a rolling or canary Prepare keeps: the last successful release and every
/// later release that has not failed. Everything else is swept.
pub(crate) fn retained_after_last_success(history: &ReleaseHistory) -> Vec<u32> {
    let floor = history.last_successful_release().map(|r| r.number).unwrap_or(0);
    history
        .releases
        .iter()
        .filter(|r| r.number >= floor && r.status != ReleaseStatus::Failed)
        .map(|r| r.number)
        .collect()
}

pub(crate) async fn apply_phase(ctx: &TaskContext, resources: &[KubernetesResource]) -> Result<()> {
    run_phase(ctx.sink(), Phase::Apply, async {
        let ordered: Vec<KubernetesResource> = apply_order(resources).into_iter().cloned().collect();
        ctx.sink().info(Phase::Apply, &format!("Applying {} resource(s)", ordered.len()));
        let out = ctx.ops().apply(&ordered).await.map_err(RolloutError::Cluster)?;
        for line in &out.lines {
            ctx.sink().info(Phase::Apply, line);
        }
        if !out.is_success() {
            return Err(RolloutError::Apply(out.text()));
        }
        Ok(())
    })
    .await
}

/// Wait for `workload`, then read its revision. A failed revision read is only a warning.
pub(crate) async fn wait_phase(
    ctx: &TaskContext,
    workload: &KubernetesResourceId,
    timeout: Duration,
) -> Result<Option<String>> {
    run_phase(ctx.sink(), Phase::WaitForSteadyState, async {
        wait_for_steady_state(
            ctx.ops(),
            ctx.sink(),
            Phase::WaitForSteadyState,
            workload,
            timeout,
            ctx.config.poll_interval,
        )
        .await?;
        match ctx.ops().latest_revision(workload).await {
            Ok(rev) => Ok(rev),
            Err(e) => {
                warn!(workload = %workload, error = %format!("{:#}", e), "revision lookup failed");
                ctx.sink().warn(
                    Phase::WaitForSteadyState,
                    &format!("Could not read the revision of {}: {:#}", workload.kind_name_ref(), e),
                );
                Ok(None)
            }
        }
    })
    .await
}

/// Describe the workloads for the operator. Never fails the task.
pub(crate) async fn wrap_up_phase(ctx: &TaskContext, workloads: &[KubernetesResourceId]) -> Result<()> {
    run_phase(ctx.sink(), Phase::WrapUp, async {
        for workload in workloads {
            match ctx.ops().describe(workload).await {
                Ok(out) if out.is_success() => {
                    for line in &out.lines {
                        ctx.sink().info(Phase::WrapUp, line);
                    }
                }
                Ok(out) => ctx.sink().warn(Phase::WrapUp, &out.text()),
                Err(e) => ctx.sink().warn(
                    Phase::WrapUp,
                    &format!("Could not describe {}: {:#}", workload.kind_name_ref(), e),
                ),
            }
        }
        Ok(())
    })
    .await
}

/// Persist the ledger once, whatever `outcome` is. On failure every release still
/// `InProgress` becomes `Failed` first. A rollout error wins over a save error.
///
/// Validation errors are raised before any cluster mutation and leave the ledger unsaved.
pub(crate) async fn commit<T>(ctx: &TaskContext, loaded: &mut LoadedHistory, outcome: Result<T>) -> Result<T> {
    if let Err(e @ RolloutError::Validation(_)) = outcome {
        warn!(scope = %loaded.scope, error = %e, "validation failed; release history left unchanged");
        return Err(e);
    }
    if outcome.is_err() {
        for r in loaded.history.releases.iter_mut().filter(|r| r.status == ReleaseStatus::InProgress) {
            r.status = ReleaseStatus::Failed;
        }
    }
    let saved = ctx.ledger.save(loaded).await;
    match (outcome, saved) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(save)) => Err(save),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(save)) => {
            error!(scope = %loaded.scope, error = %save, "release history not saved after failure");
            ctx.sink().error(Phase::WrapUp, &format!("Release history could not be saved: {}", save));
            Err(e)
        }
    }
}
