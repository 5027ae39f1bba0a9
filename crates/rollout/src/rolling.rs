//! Rolling update: the managed workload keeps its name and converges in place.

use drover_apply::{mark_versioned, stamp_revision};
use drover_core::ReleaseStatus;
use serde::{Deserialize, Serialize};

use crate::cleanup::sweep;
use crate::error::Result;
use crate::log::{run_phase, Phase};
use crate::pipeline::{self, retained_after_last_success, Rollout};
use crate::task::{TaskContext, TaskResult, TaskScope};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingDeployParams {
    /// Rendered multi-document YAML.
    pub manifests: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_dry_run: bool,
}

pub async fn run(ctx: &TaskContext, scope: &TaskScope, params: &RollingDeployParams) -> Result<TaskResult> {
    let Rollout { init, mut resources, managed, mut loaded } =
        pipeline::start(ctx, scope, &params.manifests).await?;
    let outcome: Result<TaskResult> = async {
        pipeline::finish_init(ctx, init, &resources, params.skip_dry_run).await?;

        let history = &mut loaded.history;
        let number = run_phase(ctx.sink(), Phase::Prepare, async {
            mark_versioned(&mut resources, false);
            let number = history.next_release_number();
            stamp_revision(&mut resources, number, false);
            let managed_id = resources[managed].id.clone();
            let release = history.create_new_release(resources.iter().map(|r| r.id.clone()).collect());
            release.managed_workload = Some(managed_id);
            ctx.sink().info(Phase::Prepare, &format!("Current release number is: {}", number));
            match history.last_successful_release() {
                Some(prev) => ctx.sink().info(Phase::Prepare, &format!("Previous Successful Release is {}", prev.number)),
                None => ctx.sink().info(Phase::Prepare, "No previous successful release found."),
            }
            let retain = retained_after_last_success(history);
            sweep(ctx.ops(), ctx.sink(), Phase::Prepare, history, &retain).await;
            Ok(number)
        })
        .await?;

        pipeline::apply_phase(ctx, &resources).await?;

        let workload = resources[managed].id.clone();
        let revision = pipeline::wait_phase(ctx, &workload, ctx.config.timeout(params.timeout_secs)).await?;
        if let Some(release) = history.release_mut(number) {
            release.managed_workload_revision = revision.clone();
        }

        pipeline::wrap_up_phase(ctx, std::slice::from_ref(&workload)).await?;
        if let Some(release) = history.release_mut(number) {
            release.status = ReleaseStatus::Succeeded;
        }
        Ok(TaskResult::Rolling { release_number: number, managed_workload: workload.name, revision })
    }
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}
