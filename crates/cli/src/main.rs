use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use drover_core::Release;
use drover_kubehub::ConfigMapStore;
use drover_ops::{ClusterOps, KubeOps};
use drover_persist::{HistoryStore, SqliteStore};
use drover_rollout::{
    run_task, BlueGreenDeployParams, CanaryDeployParams, EngineConfig, HistoryBackend, Ledger, LogSink, RollbackParams,
    RollingDeployParams, RouteWeight, ScaleParams, SwapParams, TargetInstances, Task, TaskContext, TaskOutcome,
    TaskParams, TaskResult, TaskScope, TracingSink, TrafficSplitParams, WorkloadSelector,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "droverctl", version, about = "Drover release orchestration")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Release name; scopes the release history
    #[arg(long = "release", global = true, env = "DROVER_RELEASE", default_value = "default")]
    release: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy manifests with a rollout strategy
    Deploy {
        #[command(subcommand)]
        strategy: DeployStrategy,
    },
    /// Roll back a release
    Rollback {
        #[command(subcommand)]
        strategy: RollbackStrategy,
    },
    /// Exchange primary and stage traffic of a blue-green release
    Swap {
        #[arg(long = "primary-service")]
        primary_service: Option<String>,
        #[arg(long = "stage-service")]
        stage_service: Option<String>,
    },
    /// Scale a workload
    Scale {
        /// `Kind/name`, `current-release` or `previous-release`
        workload: String,
        /// Replica count, or a percentage such as `50%`
        #[arg(long = "instances", value_parser = parse_instances)]
        instances: TargetInstances,
        /// Base for percentages instead of the live replica count
        #[arg(long = "max-instances")]
        max_instances: Option<i32>,
        #[arg(long = "skip-steady-state-check", action = ArgAction::SetTrue)]
        skip_steady_state_check: bool,
        #[arg(long = "timeout")]
        timeout_secs: Option<u64>,
    },
    /// Set VirtualService destination weights
    Traffic {
        /// VirtualService name (default: the one in the latest release)
        #[arg(long = "virtual-service")]
        virtual_service: Option<String>,
        /// `destination[:subset]=weight`; repeat per destination
        #[arg(long = "route", required = true, value_parser = parse_route)]
        routes: Vec<RouteWeight>,
    },
    /// Print the release history
    History,
    /// Run a task described by a JSON file
    Run {
        #[arg(long = "task")]
        task: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// Manifest file (multi-document YAML)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    #[arg(long = "timeout")]
    timeout_secs: Option<u64>,
    #[arg(long = "skip-dry-run", action = ArgAction::SetTrue)]
    skip_dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum DeployStrategy {
    Rolling(DeployArgs),
    Canary {
        #[command(flatten)]
        common: DeployArgs,
        #[arg(long = "instances", value_parser = parse_instances)]
        instances: TargetInstances,
        #[arg(long = "max-instances")]
        max_instances: Option<i32>,
    },
    BlueGreen(DeployArgs),
}

#[derive(Args, Debug)]
struct RollbackArgs {
    /// Release to roll back
    release_number: u32,
    #[arg(long = "timeout")]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum RollbackStrategy {
    Rolling(RollbackArgs),
    Canary(RollbackArgs),
    BlueGreen(RollbackArgs),
}

fn init_tracing() {
    let env = std::env::var("DROVER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DROVER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DROVER_METRICS_ADDR; expected host:port");
        }
    }
}

/// `3` is a count, `50%` a percentage.
fn parse_instances(s: &str) -> Result<TargetInstances, String> {
    let s = s.trim();
    match s.strip_suffix('%') {
        Some(pct) => pct.trim().parse().map(TargetInstances::percentage).map_err(|e| format!("bad percentage {:?}: {}", s, e)),
        None => s.parse().map(TargetInstances::count).map_err(|e| format!("bad instance count {:?}: {}", s, e)),
    }
}

/// `destination[:subset]=weight`
fn parse_route(s: &str) -> Result<RouteWeight, String> {
    let (target, weight) = s.rsplit_once('=').ok_or_else(|| format!("expected destination=weight, got {:?}", s))?;
    let weight = weight.trim().parse::<i32>().map_err(|e| format!("bad weight in {:?}: {}", s, e))?;
    let (destination, subset) = match target.split_once(':') {
        Some((host, subset)) => (host.trim().to_string(), Some(subset.trim().to_string())),
        None => (target.trim().to_string(), None),
    };
    if destination.is_empty() {
        return Err(format!("missing destination in {:?}", s));
    }
    Ok(RouteWeight { destination, subset, weight })
}

fn read_manifests(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading manifests from {}", path.display()))
}

fn task_params(command: Commands) -> Result<TaskParams> {
    Ok(match command {
        Commands::Deploy { strategy } => match strategy {
            DeployStrategy::Rolling(a) => TaskParams::RollingDeploy(RollingDeployParams {
                manifests: read_manifests(&a.file)?,
                timeout_secs: a.timeout_secs,
                skip_dry_run: a.skip_dry_run,
            }),
            DeployStrategy::Canary { common, instances, max_instances } => TaskParams::CanaryDeploy(CanaryDeployParams {
                manifests: read_manifests(&common.file)?,
                instances,
                max_instances,
                timeout_secs: common.timeout_secs,
                skip_dry_run: common.skip_dry_run,
            }),
            DeployStrategy::BlueGreen(a) => TaskParams::BlueGreenDeploy(BlueGreenDeployParams {
                manifests: read_manifests(&a.file)?,
                timeout_secs: a.timeout_secs,
                skip_dry_run: a.skip_dry_run,
            }),
        },
        Commands::Rollback { strategy } => {
            let params = |a: RollbackArgs| RollbackParams { release_number: a.release_number, timeout_secs: a.timeout_secs };
            match strategy {
                RollbackStrategy::Rolling(a) => TaskParams::RollingRollback(params(a)),
                RollbackStrategy::Canary(a) => TaskParams::CanaryRollback(params(a)),
                RollbackStrategy::BlueGreen(a) => TaskParams::BlueGreenRollback(params(a)),
            }
        }
        Commands::Swap { primary_service, stage_service } => {
            TaskParams::BlueGreenSwap(SwapParams { primary_service, stage_service })
        }
        Commands::Scale { workload, instances, max_instances, skip_steady_state_check, timeout_secs } => {
            let workload = workload.parse::<WorkloadSelector>()?;
            TaskParams::Scale(ScaleParams { workload, instances, max_instances, skip_steady_state_check, timeout_secs })
        }
        Commands::Traffic { virtual_service, routes } => {
            TaskParams::TrafficSplit(TrafficSplitParams { virtual_service, routes })
        }
        Commands::Run { task } => {
            let raw = std::fs::read_to_string(&task).with_context(|| format!("reading task from {}", task.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing task {}", task.display()))?
        }
        Commands::History => bail!("history is not a task"),
    })
}

fn history_store(config: &EngineConfig, client: &kube::Client) -> Result<Arc<dyn HistoryStore>> {
    let store: Arc<dyn HistoryStore> = match config.history_backend {
        HistoryBackend::ConfigMap => Arc::new(ConfigMapStore::new(client.clone())),
        HistoryBackend::Sqlite => Arc::new(SqliteStore::open_default()?),
    };
    Ok(store)
}

fn render_created(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_history(releases: &[Release]) {
    println!("RELEASE  STATUS             WORKLOAD                         REVISION  CREATED");
    for r in releases {
        let workload = r.managed_workload.as_ref().map(|w| w.kind_name_ref()).unwrap_or_else(|| "-".to_string());
        let revision = r.managed_workload_revision.as_deref().unwrap_or("-");
        println!("{:<8} {:<18} {:<32} {:<9} {}", r.number, r.status.to_string(), workload, revision, render_created(r.created_at));
    }
}

fn print_outcome(outcome: &TaskOutcome) {
    if outcome.is_success() {
        match &outcome.result {
            TaskResult::None => println!("task {} succeeded", outcome.task_id),
            result => match serde_json::to_string(result) {
                Ok(s) => println!("task {} succeeded: {}", outcome.task_id, s),
                Err(_) => println!("task {} succeeded", outcome.task_id),
            },
        }
    } else {
        eprintln!(
            "task {} failed ({}): {}",
            outcome.task_id,
            outcome.error_kind.as_deref().unwrap_or("unknown"),
            outcome.error_message.as_deref().unwrap_or("")
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    let client = drover_kubehub::get_kube_client().await?;
    let namespace = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let store = history_store(&config, &client)?;
    let scope = TaskScope::new(namespace, cli.release.clone());

    if matches!(cli.command, Commands::History) {
        info!(ns = %scope.namespace, release = %scope.release_name, "history invoked");
        let loaded = Ledger::new(store, false).load(&scope.key()).await?;
        let history = loaded.history;
        match cli.output {
            Output::Human => print_history(&history.releases),
            Output::Json => println!("{}", serde_json::to_string_pretty(&history.releases)?),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let params = task_params(cli.command)?;
    let ops: Arc<dyn ClusterOps> = Arc::new(KubeOps::new(client, config.field_manager.clone()));
    let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
    let ctx = Arc::new(TaskContext::new(ops, store, sink, config));

    info!(ns = %scope.namespace, release = %scope.release_name, task = params.kind(), "task invoked");
    let outcome = run_task(ctx, Task { scope, params }).await;
    match cli.output {
        Output::Human => print_outcome(&outcome),
        Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
    }
    if outcome.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(task_id = %outcome.task_id, "task failed");
        Ok(ExitCode::from(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_accept_counts_and_percentages() {
        assert_eq!(parse_instances("3").unwrap(), TargetInstances::count(3));
        assert_eq!(parse_instances("50%").unwrap(), TargetInstances::percentage(50));
        assert!(parse_instances("half").is_err());
    }

    #[test]
    fn routes_parse_destination_subset_and_weight() {
        let r = parse_route("web-v2:v2=30").unwrap();
        assert_eq!(r, RouteWeight { destination: "web-v2".into(), subset: Some("v2".into()), weight: 30 });
        assert_eq!(parse_route("stable=70").unwrap().subset, None);
        assert!(parse_route("=70").is_err());
        assert!(parse_route("stable").is_err());
    }

    #[test]
    fn scale_command_builds_scale_params() {
        let cli = Cli::try_parse_from(["droverctl", "--ns", "prod", "scale", "previous-release", "--instances", "25%"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("prod"));
        match task_params(cli.command).unwrap() {
            TaskParams::Scale(p) => {
                assert_eq!(p.workload, WorkloadSelector::PreviousRelease);
                assert_eq!(p.instances, TargetInstances::percentage(25));
            }
            other => panic!("unexpected params {:?}", other),
        }
    }
}
