//! Task entry point: one task per invocation, dispatched from a tagged parameter union.

use std::sync::Arc;

use drover_ops::ClusterOps;
use drover_persist::{HistoryStore, ScopeKey};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::blue_green::{self, BlueGreenDeployParams, SwapParams};
use crate::canary::{self, CanaryDeployParams};
use crate::config::EngineConfig;
use crate::error::{Result, RolloutError};
use crate::ledger::Ledger;
use crate::log::{LogSink, Phase};
use crate::rollback::{self, RollbackParams};
use crate::rolling::{self, RollingDeployParams};
use crate::scale::{self, ScaleParams};
use crate::traffic::{self, RouteWeight, TrafficSplitParams};

/// Collaborators shared by every phase of a task.
pub struct TaskContext {
    pub ops: Arc<dyn ClusterOps>,
    pub ledger: Ledger,
    pub sink: Arc<dyn LogSink>,
    pub config: EngineConfig,
}

impl TaskContext {
    pub fn new(
        ops: Arc<dyn ClusterOps>,
        store: Arc<dyn HistoryStore>,
        sink: Arc<dyn LogSink>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Ledger::new(store, config.ledger_cas);
        Self { ops, ledger, sink, config }
    }

    pub fn ops(&self) -> &dyn ClusterOps {
        self.ops.as_ref()
    }

    pub fn sink(&self) -> &dyn LogSink {
        self.sink.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskScope {
    pub namespace: String,
    pub release_name: String,
}

impl TaskScope {
    pub fn new(namespace: impl Into<String>, release_name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), release_name: release_name.into() }
    }

    pub fn key(&self) -> ScopeKey {
        ScopeKey::new(&self.namespace, &self.release_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskParams {
    RollingDeploy(RollingDeployParams),
    RollingRollback(RollbackParams),
    CanaryDeploy(CanaryDeployParams),
    CanaryRollback(RollbackParams),
    BlueGreenDeploy(BlueGreenDeployParams),
    BlueGreenRollback(RollbackParams),
    BlueGreenSwap(SwapParams),
    Scale(ScaleParams),
    TrafficSplit(TrafficSplitParams),
}

impl TaskParams {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskParams::RollingDeploy(_) => "rolling_deploy",
            TaskParams::RollingRollback(_) => "rolling_rollback",
            TaskParams::CanaryDeploy(_) => "canary_deploy",
            TaskParams::CanaryRollback(_) => "canary_rollback",
            TaskParams::BlueGreenDeploy(_) => "blue_green_deploy",
            TaskParams::BlueGreenRollback(_) => "blue_green_rollback",
            TaskParams::BlueGreenSwap(_) => "blue_green_swap",
            TaskParams::Scale(_) => "scale",
            TaskParams::TrafficSplit(_) => "traffic_split",
        }
    }

    /// Phase that carries the task-level failure summary.
    fn summary_phase(&self) -> Phase {
        match self {
            TaskParams::RollingDeploy(_) | TaskParams::CanaryDeploy(_) | TaskParams::BlueGreenDeploy(_) => Phase::WrapUp,
            TaskParams::RollingRollback(_) | TaskParams::CanaryRollback(_) | TaskParams::BlueGreenRollback(_) => {
                Phase::Rollback
            }
            TaskParams::BlueGreenSwap(_) => Phase::SwapServices,
            TaskParams::Scale(_) => Phase::Scale,
            TaskParams::TrafficSplit(_) => Phase::TrafficSplit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub scope: TaskScope,
    pub params: TaskParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Strategy-specific payload of a finished task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TaskResult {
    None,
    Rolling {
        release_number: u32,
        managed_workload: String,
        revision: Option<String>,
    },
    Canary {
        release_number: u32,
        canary_workload: String,
        target_instances: i32,
    },
    BlueGreen {
        release_number: u32,
        managed_workload: String,
        primary_revision: String,
        stage_revision: String,
    },
    Rollback {
        release_number: u32,
        restored_release: Option<u32>,
    },
    Swap {
        primary_revision: String,
        stage_revision: String,
    },
    Scale {
        workload: Option<String>,
        replicas: Option<i32>,
    },
    Traffic {
        virtual_service: String,
        routes: Vec<RouteWeight>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub result: TaskResult,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

async fn dispatch(ctx: &TaskContext, task: &Task) -> Result<TaskResult> {
    let scope = &task.scope;
    match &task.params {
        TaskParams::RollingDeploy(p) => rolling::run(ctx, scope, p).await,
        TaskParams::RollingRollback(p) => rollback::rolling(ctx, scope, p).await,
        TaskParams::CanaryDeploy(p) => canary::run(ctx, scope, p).await,
        TaskParams::CanaryRollback(p) => rollback::canary(ctx, scope, p).await,
        TaskParams::BlueGreenDeploy(p) => blue_green::run(ctx, scope, p).await,
        TaskParams::BlueGreenRollback(p) => rollback::blue_green(ctx, scope, p).await,
        TaskParams::BlueGreenSwap(p) => blue_green::swap(ctx, scope, p).await,
        TaskParams::Scale(p) => scale::run(ctx, scope, p).await,
        TaskParams::TrafficSplit(p) => traffic::run(ctx, scope, p).await,
    }
}

/// Run one task to completion. Never returns an error: failures, including panics,
/// become a `Failure` outcome and are written to the log sink.
pub async fn run_task(ctx: Arc<TaskContext>, task: Task) -> TaskOutcome {
    let task_id = Uuid::new_v4().to_string();
    let kind = task.params.kind();
    let summary_phase = task.params.summary_phase();
    let span = info_span!("task", id = %task_id, kind, ns = %task.scope.namespace, release = %task.scope.release_name);
    counter!("rollout_task_total", 1u64, "kind" => kind);

    let worker_ctx = ctx.clone();
    let handle = tokio::spawn(async move { dispatch(&worker_ctx, &task).await }.instrument(span.clone()));
    let result = match handle.await {
        Ok(r) => r,
        Err(join) => Err(RolloutError::Cluster(anyhow::anyhow!("task aborted: {}", join))),
    };

    let _entered = span.enter();
    match result {
        Ok(result) => {
            info!("task succeeded");
            TaskOutcome { task_id, status: TaskStatus::Success, error_message: None, error_kind: None, result }
        }
        Err(e) => {
            counter!("rollout_task_failed_total", 1u64, "kind" => kind);
            error!(error = %e, error_kind = e.kind(), "task failed");
            ctx.sink().error(summary_phase, &format!("Task failed: {}", e));
            TaskOutcome {
                task_id,
                status: TaskStatus::Failure,
                error_message: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
                result: TaskResult::None,
            }
        }
    }
}
