use std::time::{Duration, Instant};

use drover_core::KubernetesResourceId;
use drover_ops::{ClusterOps, RolloutStatus};

use crate::error::{Result, RolloutError};
use crate::log::{LogSink, Phase};

/// Poll `workload` until it converges, fails, or `timeout` elapses.
pub async fn wait_for_steady_state(
    ops: &dyn ClusterOps,
    sink: &dyn LogSink,
    phase: Phase,
    workload: &KubernetesResourceId,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    // Timeouts too large for an Instant never expire.
    let deadline = Instant::now().checked_add(timeout);
    sink.info(phase, &format!("Waiting for {} to reach steady state", workload.kind_name_ref()));
    let mut last = String::new();
    loop {
        match ops.rollout_status(workload).await.map_err(RolloutError::Cluster)? {
            RolloutStatus::Converged(msg) => {
                sink.info(phase, &msg);
                return Ok(());
            }
            RolloutStatus::Failed(reason) => {
                return Err(RolloutError::WorkloadFailed { workload: workload.kind_name_ref(), reason });
            }
            RolloutStatus::Progressing(msg) => {
                if msg != last {
                    sink.info(phase, &msg);
                    last = msg;
                }
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(RolloutError::SteadyStateTimeout {
                workload: workload.kind_name_ref(),
                timeout_secs: timeout.as_secs(),
            });
        }
        let left = deadline.map_or(poll, |d| d.saturating_duration_since(Instant::now()));
        tokio::time::sleep(poll.min(left)).await;
    }
}
