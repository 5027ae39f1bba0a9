//! Rollbacks. Each variant restores the newest rollback-eligible release before the one
//! being rolled back; having nothing to restore is a successful no-op.

use drover_core::{KubernetesResourceId, Release, ReleaseHistory, ReleaseStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::blue_green::{discover_services, live_resource, repoint_services, selected_revision};
use crate::cleanup::{delete_resources, CleanupReport};
use crate::error::{Result, RolloutError};
use crate::log::{run_phase, Phase};
use crate::pipeline;
use crate::steady::wait_for_steady_state;
use crate::task::{TaskContext, TaskResult, TaskScope};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackParams {
    /// Release to roll back from; 0 means there is nothing to roll back.
    pub release_number: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn skipped(number: u32) -> TaskResult {
    TaskResult::Rollback { release_number: number, restored_release: None }
}

/// The release to restore, or `None` after logging why there is nothing to do.
fn restore_target(ctx: &TaskContext, history: &ReleaseHistory, number: u32) -> Option<Release> {
    let sink = ctx.sink();
    if number == 0 {
        sink.info(Phase::Rollback, "No failed release found. Skipping rollback.");
        return None;
    }
    if history.release(number).is_none() {
        sink.info(Phase::Rollback, &format!("Release {} not found. Skipping rollback.", number));
        return None;
    }
    match history.previous_rollback_eligible_release(number) {
        Some(prev) => {
            sink.info(Phase::Rollback, &format!("Previous eligible Release is {} with status {}", prev.number, prev.status));
            Some(prev.clone())
        }
        None => {
            sink.info(Phase::Rollback, "No previous eligible release found. Can't rollback.");
            None
        }
    }
}

fn set_status(history: &mut ReleaseHistory, number: u32, status: ReleaseStatus) {
    if let Some(r) = history.release_mut(number) {
        r.status = status;
    }
}

/// Record the rollback status of `number` from `result`.
fn settle(history: &mut ReleaseHistory, number: u32, result: Result<TaskResult>) -> Result<TaskResult> {
    match &result {
        Ok(TaskResult::Rollback { restored_release: Some(_), .. }) => {
            set_status(history, number, ReleaseStatus::RollbackSucceeded)
        }
        Ok(_) => {}
        Err(_) => set_status(history, number, ReleaseStatus::RollbackFailed),
    }
    result
}

async fn scale_to(ctx: &TaskContext, workload: &KubernetesResourceId, replicas: i32) -> Result<()> {
    ctx.sink().info(Phase::Rollback, &format!("Scaling {} to {} replica(s)", workload.kind_name_ref(), replicas));
    let out = ctx.ops().scale(workload, replicas).await.map_err(RolloutError::Cluster)?;
    for line in &out.lines {
        ctx.sink().info(Phase::Rollback, line);
    }
    if !out.is_success() {
        return Err(RolloutError::Apply(out.text()));
    }
    Ok(())
}

/// Undo the managed workload to the restored release's revision, wait, then delete
/// what only the rolled-back release introduced.
pub async fn rolling(ctx: &TaskContext, scope: &TaskScope, params: &RollbackParams) -> Result<TaskResult> {
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let number = params.release_number;
    let history = &mut loaded.history;
    let outcome = run_phase(ctx.sink(), Phase::Rollback, async {
        let Some(previous) = restore_target(ctx, history, number) else {
            return Ok(skipped(number));
        };
        let Some(previous_workload) = previous.managed_workload.clone() else {
            ctx.sink().info(Phase::Rollback, "No Managed Workload found in previous eligible release. Skipping rollback.");
            return Ok(skipped(number));
        };
        let current = history.release(number).cloned();
        let workload = current.as_ref().and_then(|r| r.managed_workload.clone()).unwrap_or(previous_workload);
        let result: Result<TaskResult> = async {
            ctx.sink().info(Phase::Rollback, &format!("\nRolling back to release {}", previous.number));
            let out = ctx
                .ops()
                .rollout_undo(&workload, previous.managed_workload_revision.as_deref())
                .await
                .map_err(RolloutError::Cluster)?;
            for line in &out.lines {
                ctx.sink().info(Phase::Rollback, line);
            }
            if !out.is_success() {
                return Err(RolloutError::Apply(out.text()));
            }
            wait_for_steady_state(
                ctx.ops(),
                ctx.sink(),
                Phase::Rollback,
                &workload,
                ctx.config.timeout(params.timeout_secs),
                ctx.config.poll_interval,
            )
            .await?;
            if let Some(current) = &current {
                let mut report = CleanupReport::default();
                delete_resources(ctx.ops(), ctx.sink(), Phase::Rollback, &current.resources, &previous.resources, &mut report)
                    .await;
                if !report.deleted.is_empty() {
                    info!(deleted = report.deleted.len(), "pruned resources introduced by the rolled back release");
                }
            }
            Ok(TaskResult::Rollback { release_number: number, restored_release: Some(previous.number) })
        }
        .await;
        settle(history, number, result)
    })
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}

/// Scale the canary of the rolled-back release to zero and the restored release's
/// workload back to its recorded size.
pub async fn canary(ctx: &TaskContext, scope: &TaskScope, params: &RollbackParams) -> Result<TaskResult> {
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let number = params.release_number;
    let history = &mut loaded.history;
    let outcome = run_phase(ctx.sink(), Phase::Rollback, async {
        let Some(previous) = restore_target(ctx, history, number) else {
            return Ok(skipped(number));
        };
        let Some(previous_workload) = previous.managed_workload.clone() else {
            ctx.sink().info(Phase::Rollback, "No Managed Workload found in previous eligible release. Skipping rollback.");
            return Ok(skipped(number));
        };
        let current_workload = history.release(number).and_then(|r| r.managed_workload.clone());
        let result: Result<TaskResult> = async {
            if let Some(canary) = &current_workload {
                scale_to(ctx, canary, 0).await?;
            }
            match previous.target_replicas {
                Some(replicas) => {
                    scale_to(ctx, &previous_workload, replicas).await?;
                    wait_for_steady_state(
                        ctx.ops(),
                        ctx.sink(),
                        Phase::Rollback,
                        &previous_workload,
                        ctx.config.timeout(params.timeout_secs),
                        ctx.config.poll_interval,
                    )
                    .await?;
                }
                None => ctx.sink().info(
                    Phase::Rollback,
                    &format!("Release {} recorded no replica count; leaving {} as is", previous.number, previous_workload.kind_name_ref()),
                ),
            }
            Ok(TaskResult::Rollback { release_number: number, restored_release: Some(previous.number) })
        }
        .await;
        settle(history, number, result)
    })
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}

/// Mark the release failed and, if production traffic is on it, send traffic back to
/// the restored release. Workloads are left in place.
pub async fn blue_green(ctx: &TaskContext, scope: &TaskScope, params: &RollbackParams) -> Result<TaskResult> {
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let number = params.release_number;
    let history = &mut loaded.history;
    let outcome = run_phase(ctx.sink(), Phase::Rollback, async {
        if number == 0 {
            ctx.sink().info(Phase::Rollback, "No failed release found. Skipping rollback.");
            return Ok(skipped(number));
        }
        let Some(current) = history.release(number).cloned() else {
            ctx.sink().info(Phase::Rollback, &format!("Release {} not found. Skipping rollback.", number));
            return Ok(skipped(number));
        };
        let previous = history.previous_rollback_eligible_release(number).cloned();

        let revision = match &current.managed_workload {
            Some(workload) => match ctx.ops().latest_revision(workload).await {
                Ok(rev) => rev,
                Err(e) => {
                    warn!(workload = %workload, error = %format!("{:#}", e), "revision lookup failed");
                    None
                }
            },
            None => None,
        };
        if let Some(r) = history.release_mut(number) {
            r.status = ReleaseStatus::Failed;
            if revision.is_some() {
                r.managed_workload_revision = revision;
            }
        }
        ctx.sink().info(Phase::Rollback, &format!("Release {} marked Failed", number));

        let Some(previous) = previous else {
            ctx.sink().info(Phase::Rollback, "No previous eligible release found. Traffic unchanged.");
            return Ok(skipped(number));
        };
        let (primary_id, stage_id) = match discover_services(ctx, history).await {
            Ok(ids) => ids,
            Err(e) => {
                ctx.sink().warn(Phase::Rollback, &format!("Traffic unchanged: {}", e));
                return Ok(skipped(number));
            }
        };
        let (Some(primary), Some(stage)) = (live_resource(ctx, &primary_id).await?, live_resource(ctx, &stage_id).await?)
        else {
            ctx.sink().warn(Phase::Rollback, "Primary or stage service missing from the cluster. Traffic unchanged.");
            return Ok(skipped(number));
        };
        let rolled_back = number.to_string();
        if selected_revision(&primary).as_deref() != Some(rolled_back.as_str()) {
            ctx.sink().info(
                Phase::Rollback,
                &format!("Primary service is not serving release {}. Traffic unchanged.", number),
            );
            return Ok(skipped(number));
        }
        repoint_services(ctx, Phase::Rollback, primary, &previous.number.to_string(), stage, &rolled_back).await?;
        Ok(TaskResult::Rollback { release_number: number, restored_release: Some(previous.number) })
    })
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}
