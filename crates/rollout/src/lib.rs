//! Drover rollout engine: the release ledger, rolling/canary/blue-green strategies,
//! rollbacks, manual scale and traffic shifting. One task per invocation; the ledger is
//! read at the start and written once at the end.

#![forbid(unsafe_code)]

pub mod blue_green;
pub mod canary;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod instances;
pub mod ledger;
pub mod log;
mod pipeline;
pub mod rollback;
pub mod rolling;
pub mod scale;
pub mod steady;
pub mod task;
pub mod traffic;

pub use blue_green::{BlueGreenDeployParams, SwapParams};
pub use canary::CanaryDeployParams;
pub use cleanup::CleanupReport;
pub use config::{EngineConfig, HistoryBackend};
pub use error::{Result, RolloutError};
pub use instances::{InstanceUnit, TargetInstances};
pub use ledger::{Ledger, LoadedHistory};
pub use log::{CommandStatus, LogLevel, LogLine, LogSink, MemorySink, Phase, TracingSink};
pub use rollback::RollbackParams;
pub use rolling::RollingDeployParams;
pub use scale::{ScaleParams, WorkloadSelector};
pub use task::{run_task, Task, TaskContext, TaskOutcome, TaskParams, TaskResult, TaskScope, TaskStatus};
pub use traffic::{RouteWeight, TrafficSplitParams};
