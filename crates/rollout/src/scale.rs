//! Manual scale of one workload, named directly or through the release history.

use std::fmt;
use std::str::FromStr;

use drover_core::{KubernetesResourceId, ReleaseHistory};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RolloutError};
use crate::instances::TargetInstances;
use crate::log::{run_phase, Phase};
use crate::pipeline;
use crate::steady::wait_for_steady_state;
use crate::task::{TaskContext, TaskResult, TaskScope};

const CURRENT_RELEASE: &str = "current-release";
const PREVIOUS_RELEASE: &str = "previous-release";

/// Which workload to scale: `Kind/name`, `namespace/Kind/name`, or one of the
/// expressions `current-release` / `previous-release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkloadSelector {
    Literal(KubernetesResourceId),
    /// Managed workload of the latest release.
    CurrentRelease,
    /// Managed workload of the newest rollback-eligible release before the latest one.
    PreviousRelease,
}

impl FromStr for WorkloadSelector {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            CURRENT_RELEASE => Ok(WorkloadSelector::CurrentRelease),
            PREVIOUS_RELEASE => Ok(WorkloadSelector::PreviousRelease),
            other => other
                .parse::<KubernetesResourceId>()
                .map(WorkloadSelector::Literal)
                .map_err(|e| RolloutError::Validation(e.to_string())),
        }
    }
}

impl TryFrom<String> for WorkloadSelector {
    type Error = RolloutError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadSelector::Literal(id) => write!(f, "{}", id),
            WorkloadSelector::CurrentRelease => f.write_str(CURRENT_RELEASE),
            WorkloadSelector::PreviousRelease => f.write_str(PREVIOUS_RELEASE),
        }
    }
}

impl From<WorkloadSelector> for String {
    fn from(s: WorkloadSelector) -> Self {
        s.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleParams {
    pub workload: WorkloadSelector,
    pub instances: TargetInstances,
    #[serde(default)]
    pub max_instances: Option<i32>,
    #[serde(default)]
    pub skip_steady_state_check: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Resolve the selector against `history`. `Ok(None)` means there is nothing to scale.
pub fn resolve_workload(
    selector: &WorkloadSelector,
    history: &ReleaseHistory,
    namespace: &str,
) -> Result<Option<KubernetesResourceId>> {
    match selector {
        WorkloadSelector::Literal(id) => {
            let mut id = id.clone();
            if id.namespace.is_none() {
                id.namespace = Some(namespace.to_string());
            }
            Ok(Some(id))
        }
        WorkloadSelector::CurrentRelease => history
            .latest_release()
            .and_then(|r| r.managed_workload.clone())
            .map(Some)
            .ok_or_else(|| RolloutError::Validation("no managed workload recorded for the current release".into())),
        WorkloadSelector::PreviousRelease => Ok(history
            .latest_release()
            .and_then(|latest| history.previous_rollback_eligible_release(latest.number))
            .and_then(|r| r.managed_workload.clone())),
    }
}

pub async fn run(ctx: &TaskContext, scope: &TaskScope, params: &ScaleParams) -> Result<TaskResult> {
    params.instances.validate()?;
    let mut loaded = ctx.ledger.load(&scope.key()).await?;
    let history = &loaded.history;
    let outcome: Result<TaskResult> = async {
        let scaled = run_phase(ctx.sink(), Phase::Scale, async {
            let Some(workload) = resolve_workload(&params.workload, history, &scope.namespace)? else {
                ctx.sink().info(Phase::Scale, "No previous eligible release found. Skipping scale.");
                return Ok(None);
            };
            let base = match params.max_instances {
                Some(n) => n,
                None => match ctx.ops().current_replicas(&workload).await {
                    Ok(Some(n)) => n,
                    Ok(None) => 1,
                    Err(e) => {
                        warn!(workload = %workload, error = %format!("{:#}", e), "replica lookup failed");
                        1
                    }
                },
            };
            let target = params.instances.resolve(base);
            if params.instances.raised_to_minimum(base) {
                ctx.sink().info(Phase::Scale, "Computed instances below 1; using 1");
            }
            ctx.sink().info(Phase::Scale, &format!("Scaling {} to {} replica(s)", workload.kind_name_ref(), target));
            let out = ctx.ops().scale(&workload, target).await.map_err(RolloutError::Cluster)?;
            for line in &out.lines {
                ctx.sink().info(Phase::Scale, line);
            }
            if !out.is_success() {
                return Err(RolloutError::Apply(out.text()));
            }
            Ok(Some((workload, target)))
        })
        .await?;

        let Some((workload, target)) = scaled else {
            return Ok(TaskResult::Scale { workload: None, replicas: None });
        };
        if params.skip_steady_state_check {
            ctx.sink().info(Phase::Scale, "Skipping steady state check");
        } else {
            run_phase(
                ctx.sink(),
                Phase::WaitForSteadyState,
                wait_for_steady_state(
                    ctx.ops(),
                    ctx.sink(),
                    Phase::WaitForSteadyState,
                    &workload,
                    ctx.config.timeout(params.timeout_secs),
                    ctx.config.poll_interval,
                ),
            )
            .await?;
        }
        Ok(TaskResult::Scale { workload: Some(workload.kind_name_ref()), replicas: Some(target) })
    }
    .await;
    pipeline::commit(ctx, &mut loaded, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::ReleaseStatus;

    fn history() -> ReleaseHistory {
        let mut h = ReleaseHistory::new();
        for name in ["web-1", "web-2"] {
            let id = KubernetesResourceId::new("Deployment", name, Some("prod"));
            let r = h.create_new_release(vec![id.clone()]);
            r.managed_workload = Some(id);
            r.status = ReleaseStatus::Succeeded;
        }
        h
    }

    #[test]
    fn selector_parses_expressions_and_literals() {
        assert_eq!("current-release".parse::<WorkloadSelector>().unwrap(), WorkloadSelector::CurrentRelease);
        assert_eq!("previous-release".parse::<WorkloadSelector>().unwrap(), WorkloadSelector::PreviousRelease);
        let lit: WorkloadSelector = "Deployment/web".parse().unwrap();
        assert_eq!(lit, WorkloadSelector::Literal(KubernetesResourceId::new("Deployment", "web", None)));
        assert_eq!("web".parse::<WorkloadSelector>().unwrap_err().kind(), "validation");
    }

    #[test]
    fn selector_is_a_plain_string_in_json() {
        let p: ScaleParams = serde_json::from_str(
            r#"{"workload":"previous-release","instances":{"unit":"COUNT","value":2}}"#,
        )
        .unwrap();
        assert_eq!(p.workload, WorkloadSelector::PreviousRelease);
        assert_eq!(serde_json::to_value(&p.workload).unwrap(), "previous-release");
    }

    #[test]
    fn expressions_resolve_against_history() {
        let h = history();
        let cur = resolve_workload(&WorkloadSelector::CurrentRelease, &h, "prod").unwrap().unwrap();
        assert_eq!(cur.name, "web-2");
        let prev = resolve_workload(&WorkloadSelector::PreviousRelease, &h, "prod").unwrap().unwrap();
        assert_eq!(prev.name, "web-1");
        let lit = resolve_workload(&"Deployment/api".parse().unwrap(), &h, "prod").unwrap().unwrap();
        assert_eq!(lit.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn previous_without_eligible_release_is_none() {
        let mut h = ReleaseHistory::new();
        h.create_new_release(vec![]).status = ReleaseStatus::Succeeded;
        assert!(resolve_workload(&WorkloadSelector::PreviousRelease, &h, "prod").unwrap().is_none());
        assert!(resolve_workload(&WorkloadSelector::CurrentRelease, &ReleaseHistory::new(), "prod").is_err());
    }
}
