#![forbid(unsafe_code)]

mod common;

use common::*;
use drover_core::{ReleaseHistory, ReleaseStatus};
use drover_ops::OpCall;
use drover_rollout::{
    RollingDeployParams, RouteWeight, ScaleParams, TargetInstances, TaskParams, TaskResult, TrafficSplitParams,
    WorkloadSelector,
};

fn two_releases() -> ReleaseHistory {
    let mut h = ReleaseHistory::new();
    for name in ["web-1", "web-2"] {
        let workload = drover_core::KubernetesResourceId { versioned: true, ..id("Deployment", name) };
        let release = h.create_new_release(vec![workload.clone()]);
        release.managed_workload = Some(workload);
        release.status = ReleaseStatus::Succeeded;
    }
    h
}

fn scale(workload: WorkloadSelector, instances: TargetInstances) -> TaskParams {
    TaskParams::Scale(ScaleParams {
        workload,
        instances,
        max_instances: None,
        skip_steady_state_check: false,
        timeout_secs: None,
    })
}

#[tokio::test]
async fn previous_release_expression_resolves_to_the_older_workload() {
    let h = Harness::new();
    h.seed(&two_releases());
    let outcome = h.run(scale(WorkloadSelector::PreviousRelease, TargetInstances::count(3))).await;
    assert_success(&outcome);
    assert_eq!(
        outcome.result,
        TaskResult::Scale { workload: Some("Deployment/web-1".into()), replicas: Some(3) }
    );
    let scaled: Vec<(String, i32)> = h.ops.scaled().into_iter().map(|(w, n)| (w.name, n)).collect();
    assert_eq!(scaled, vec![("web-1".to_string(), 3)]);
    assert!(h.ops.calls().iter().any(|c| matches!(c, OpCall::RolloutStatus(w) if w.name == "web-1")));
    // The ledger is saved once but its releases are untouched.
    assert_eq!(h.store.save_count(), 1);
    assert_eq!(h.statuses(), vec![(1, ReleaseStatus::Succeeded), (2, ReleaseStatus::Succeeded)]);
}

#[tokio::test]
async fn previous_release_without_eligible_release_is_a_no_op() {
    let h = Harness::new();
    let mut history = ReleaseHistory::new();
    history.create_new_release(vec![id("Deployment", "web")]).status = ReleaseStatus::Succeeded;
    h.seed(&history);

    let outcome = h.run(scale(WorkloadSelector::PreviousRelease, TargetInstances::count(3))).await;
    assert_success(&outcome);
    assert_eq!(outcome.result, TaskResult::Scale { workload: None, replicas: None });
    assert_eq!(h.ops.mutation_count(), 0);
}

#[tokio::test]
async fn percentage_scale_uses_live_replicas_and_can_skip_the_wait() {
    let h = Harness::new();
    assert_success(
        &h.run(TaskParams::RollingDeploy(RollingDeployParams { manifests: ROLLING_V1.into(), ..Default::default() }))
            .await,
    );
    h.ops.clear_calls();

    let outcome = h
        .run(TaskParams::Scale(ScaleParams {
            workload: WorkloadSelector::CurrentRelease,
            instances: TargetInstances::percentage(50),
            max_instances: None,
            skip_steady_state_check: true,
            timeout_secs: None,
        }))
        .await;
    assert_success(&outcome);
    assert_eq!(outcome.result, TaskResult::Scale { workload: Some("Deployment/web".into()), replicas: Some(2) });
    assert_eq!(h.ops.live(&id("Deployment", "web")).unwrap()["spec"]["replicas"], 2);
    assert!(!h.ops.calls().iter().any(|c| matches!(c, OpCall::RolloutStatus(_))));
}

#[tokio::test]
async fn literal_workload_and_scale_failure() {
    let h = Harness::new();
    h.ops.fail_scale();
    let outcome = h.run(scale("Deployment/api".parse().unwrap(), TargetInstances::count(1))).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("apply"));
    assert_eq!(h.ops.scaled()[0].0, id("Deployment", "api"));
    assert_eq!(h.store.save_count(), 1);
}

#[tokio::test]
async fn invalid_instances_fail_before_the_ledger_is_read() {
    let h = Harness::new();
    let outcome = h.run(scale(WorkloadSelector::CurrentRelease, TargetInstances::count(-1))).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("validation"));
    assert_eq!(h.store.save_count(), 0);
    assert!(h.ops.calls().is_empty());
}

#[tokio::test]
async fn current_release_without_history_is_rejected_without_a_save() {
    let h = Harness::new();
    let outcome = h.run(scale(WorkloadSelector::CurrentRelease, TargetInstances::count(2))).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("validation"));
    assert_eq!(h.store.save_count(), 0);
    assert_eq!(h.ops.mutation_count(), 0);
}

fn split(virtual_service: Option<&str>, stable: i32, canary: i32) -> TaskParams {
    TaskParams::TrafficSplit(TrafficSplitParams {
        virtual_service: virtual_service.map(str::to_string),
        routes: vec![
            RouteWeight { destination: "stable".into(), subset: None, weight: stable },
            RouteWeight { destination: "canary".into(), subset: None, weight: canary },
        ],
    })
}

#[tokio::test]
async fn traffic_split_rewrites_the_release_virtual_service() {
    let h = Harness::new();
    let manifests = format!("{}{}", ROLLING_V1, VIRTUAL_SERVICE);
    assert_success(
        &h.run(TaskParams::RollingDeploy(RollingDeployParams { manifests, ..Default::default() })).await,
    );

    let outcome = h.run(split(None, 80, 20)).await;
    assert_success(&outcome);
    let live = h.ops.live(&id("VirtualService", "web")).unwrap();
    let route = &live["spec"]["http"][0]["route"];
    assert_eq!(route[0]["destination"]["subset"], "stable");
    assert_eq!(route[0]["weight"], 80);
    assert_eq!(route[1]["destination"]["host"], "web");
    assert_eq!(route[1]["destination"]["subset"], "canary");
    assert_eq!(route[1]["weight"], 20);
    assert_eq!(live["spec"]["hosts"][0], "web.example.com");
}

#[tokio::test]
async fn traffic_split_needs_an_unambiguous_routing_resource() {
    let h = Harness::new();
    assert_success(
        &h.run(TaskParams::RollingDeploy(RollingDeployParams { manifests: ROLLING_V1.into(), ..Default::default() }))
            .await,
    );
    h.ops.clear_calls();
    let outcome = h.run(split(None, 50, 50)).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("traffic_routing"));
    assert_eq!(h.ops.mutation_count(), 0);

    let missing = h.run(split(Some("checkout"), 50, 50)).await;
    assert_eq!(missing.error_kind.as_deref(), Some("traffic_routing"));
}

#[tokio::test]
async fn traffic_weights_must_sum_to_one_hundred() {
    let h = Harness::new();
    let outcome = h.run(split(Some("web"), 80, 30)).await;
    assert_eq!(outcome.error_kind.as_deref(), Some("validation"));
    assert_eq!(h.store.save_count(), 0);
}
