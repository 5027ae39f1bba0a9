#![forbid(unsafe_code)]

mod common;

use common::*;
use drover_core::{labels, ReleaseStatus};
use drover_ops::{OpCall, RolloutStatus};
use drover_rollout::{
    BlueGreenDeployParams, CanaryDeployParams, RollbackParams, RollingDeployParams, SwapParams, TargetInstances,
    TaskParams, TaskResult,
};

fn rolling_deploy(manifests: &str) -> TaskParams {
    TaskParams::RollingDeploy(RollingDeployParams { manifests: manifests.into(), ..Default::default() })
}

fn rollback(number: u32) -> RollbackParams {
    RollbackParams { release_number: number, timeout_secs: None }
}

const EXTRA_ACCOUNT: &str = r#"
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: web-sa
"#;

#[tokio::test]
async fn release_zero_is_a_no_op_for_every_variant() {
    for params in [
        TaskParams::RollingRollback(rollback(0)),
        TaskParams::CanaryRollback(rollback(0)),
        TaskParams::BlueGreenRollback(rollback(0)),
    ] {
        let h = Harness::new();
        let outcome = h.run(params).await;
        assert_success(&outcome);
        assert_eq!(outcome.result, TaskResult::Rollback { release_number: 0, restored_release: None });
        assert!(h.ops.calls().is_empty());
        assert!(h.sink.contains("No failed release found. Skipping rollback."));
        assert_eq!(h.store.save_count(), 1);
    }
}

#[tokio::test]
async fn rolling_rollback_undoes_to_the_previous_revision_and_prunes() {
    let h = Harness::new();
    let web = id("Deployment", "web");
    h.ops.set_revision(&web, "1");
    assert_success(&h.run(rolling_deploy(ROLLING_V1)).await);

    h.ops.set_revision(&web, "2");
    h.ops.script_status(&web, vec![RolloutStatus::Failed("ProgressDeadlineExceeded".into())]);
    let failed = h.run(rolling_deploy(&format!("{}{}", ROLLING_V1, EXTRA_ACCOUNT))).await;
    assert!(!failed.is_success());
    assert_eq!(h.statuses(), vec![(1, ReleaseStatus::Succeeded), (2, ReleaseStatus::Failed)]);

    h.ops.script_status(&web, vec![RolloutStatus::Converged("rolled back".into())]);
    h.ops.clear_calls();
    let outcome = h.run(TaskParams::RollingRollback(rollback(2))).await;
    assert_success(&outcome);
    assert_eq!(outcome.result, TaskResult::Rollback { release_number: 2, restored_release: Some(1) });
    assert!(h.sink.contains("Previous eligible Release is 1 with status Succeeded"));

    let calls = h.ops.calls();
    assert!(calls.iter().any(|c| matches!(c, OpCall::RolloutUndo(w, Some(rev)) if w.same_object(&web) && rev == "1")));
    let mut deleted = names(&h.ops.deleted());
    deleted.sort();
    assert_eq!(deleted, vec!["web-config-2", "web-sa"]);
    assert!(h.ops.live(&id("ConfigMap", "web-config-1")).is_some());
    assert_eq!(h.statuses(), vec![(1, ReleaseStatus::Succeeded), (2, ReleaseStatus::RollbackSucceeded)]);
}

#[tokio::test]
async fn rollback_without_an_eligible_release_succeeds_without_mutations() {
    let h = Harness::new();
    h.ops.fail_apply();
    let failed = h.run(rolling_deploy(ROLLING_V1)).await;
    assert!(!failed.is_success());
    h.ops.heal();
    h.ops.clear_calls();

    let outcome = h.run(TaskParams::RollingRollback(rollback(1))).await;
    assert_success(&outcome);
    assert_eq!(h.ops.mutation_count(), 0);
    assert!(h.sink.contains("No previous eligible release found. Can't rollback."));
    assert_eq!(h.statuses(), vec![(1, ReleaseStatus::Failed)]);
}

#[tokio::test]
async fn failed_undo_marks_the_release_rollback_failed() {
    let h = Harness::new();
    assert_success(&h.run(rolling_deploy(ROLLING_V1)).await);
    assert_success(&h.run(rolling_deploy(ROLLING_V1)).await);
    h.ops.fail_undo();
    let outcome = h.run(TaskParams::RollingRollback(rollback(2))).await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.error_kind.as_deref(), Some("apply"));
    assert_eq!(h.statuses(), vec![(1, ReleaseStatus::Succeeded), (2, ReleaseStatus::RollbackFailed)]);
}

#[tokio::test]
async fn rollback_timeout_marks_the_release_rollback_failed() {
    let h = Harness::new();
    assert_success(&h.run(rolling_deploy(ROLLING_V1)).await);
    assert_success(&h.run(rolling_deploy(ROLLING_V1)).await);
    h.ops.script_status(&id("Deployment", "web"), vec![RolloutStatus::Progressing("waiting".into())]);
    let outcome =
        h.run(TaskParams::RollingRollback(RollbackParams { release_number: 2, timeout_secs: Some(0) })).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("steady_state_timeout"));
    assert_eq!(h.statuses()[1], (2, ReleaseStatus::RollbackFailed));
}

#[tokio::test]
async fn canary_rollback_scales_canaries_instead_of_undoing() {
    let h = Harness::new();
    let deploy = |instances| {
        TaskParams::CanaryDeploy(CanaryDeployParams {
            manifests: ROLLING_V1.into(),
            instances,
            max_instances: Some(10),
            timeout_secs: None,
            skip_dry_run: true,
        })
    };
    assert_success(&h.run(deploy(TargetInstances::percentage(50))).await);
    assert_success(&h.run(deploy(TargetInstances::count(2))).await);
    h.ops.clear_calls();

    let outcome = h.run(TaskParams::CanaryRollback(rollback(2))).await;
    assert_success(&outcome);
    let scaled: Vec<(String, i32)> = h.ops.scaled().into_iter().map(|(w, n)| (w.name, n)).collect();
    assert_eq!(scaled, vec![("web-canary-2".to_string(), 0), ("web-canary-1".to_string(), 5)]);
    assert!(!h.ops.calls().iter().any(|c| matches!(c, OpCall::RolloutUndo(..))));
    assert_eq!(h.statuses()[1], (2, ReleaseStatus::RollbackSucceeded));
}

#[tokio::test]
async fn blue_green_rollback_restores_primary_traffic() {
    let h = Harness::new();
    let deploy = || TaskParams::BlueGreenDeploy(BlueGreenDeployParams { manifests: BLUE_GREEN.into(), ..Default::default() });
    assert_success(&h.run(deploy()).await);
    assert_success(&h.run(deploy()).await);
    assert_success(&h.run(TaskParams::BlueGreenSwap(SwapParams::default())).await);
    h.ops.set_revision(&id("Deployment", "web-2"), "7");

    let outcome = h.run(TaskParams::BlueGreenRollback(rollback(2))).await;
    assert_success(&outcome);
    assert_eq!(outcome.result, TaskResult::Rollback { release_number: 2, restored_release: Some(1) });

    let selector = |name: &str| h.ops.live(&id("Service", name)).unwrap()["spec"]["selector"][labels::REVISION].clone();
    assert_eq!(selector("web-primary"), "1");
    assert_eq!(selector("web-stage"), "2");

    let history = h.history();
    let release = history.release(2).unwrap();
    assert_eq!(release.status, ReleaseStatus::Failed);
    assert_eq!(release.managed_workload_revision.as_deref(), Some("7"));
    assert!(h.ops.live(&id("Deployment", "web-2")).is_some());
    assert!(h.ops.deleted().is_empty());
}

#[tokio::test]
async fn blue_green_rollback_leaves_traffic_when_primary_is_elsewhere() {
    let h = Harness::new();
    let deploy = || TaskParams::BlueGreenDeploy(BlueGreenDeployParams { manifests: BLUE_GREEN.into(), ..Default::default() });
    assert_success(&h.run(deploy()).await);
    assert_success(&h.run(deploy()).await);
    h.ops.clear_calls();

    let outcome = h.run(TaskParams::BlueGreenRollback(rollback(2))).await;
    assert_success(&outcome);
    assert_eq!(h.ops.mutation_count(), 0);
    assert_eq!(h.statuses()[1], (2, ReleaseStatus::Failed));
}
