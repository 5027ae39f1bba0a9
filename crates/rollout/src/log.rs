//! Execution log sink: operator-visible progress per phase.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{Result, RolloutError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Prepare,
    Apply,
    WaitForSteadyState,
    WrapUp,
    Rollback,
    Scale,
    TrafficSplit,
    SwapServices,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::Prepare => "Prepare",
            Phase::Apply => "Apply",
            Phase::WaitForSteadyState => "WaitForSteadyState",
            Phase::WrapUp => "WrapUp",
            Phase::Rollback => "Rollback",
            Phase::Scale => "Scale",
            Phase::TrafficSplit => "TrafficSplit",
            Phase::SwapServices => "SwapServices",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failure,
}

pub trait LogSink: Send + Sync {
    fn log(&self, phase: Phase, text: &str, level: LogLevel, status: Option<CommandStatus>);

    fn info(&self, phase: Phase, text: &str) {
        self.log(phase, text, LogLevel::Info, None)
    }

    fn warn(&self, phase: Phase, text: &str) {
        self.log(phase, text, LogLevel::Warn, None)
    }

    fn error(&self, phase: Phase, text: &str) {
        self.log(phase, text, LogLevel::Error, None)
    }
}

/// Forwards every line to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, phase: Phase, text: &str, level: LogLevel, status: Option<CommandStatus>) {
        match level {
            LogLevel::Info => info!(phase = %phase, status = ?status, "{}", text),
            LogLevel::Warn => warn!(phase = %phase, status = ?status, "{}", text),
            LogLevel::Error => error!(phase = %phase, status = ?status, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub phase: Phase,
    pub text: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
}

/// Keeps lines in memory and forwards them to `tracing`.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<LogLine>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn texts(&self, phase: Phase) -> Vec<String> {
        self.lines().into_iter().filter(|l| l.phase == phase).map(|l| l.text).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.text.contains(needle))
    }

    /// Terminal statuses recorded for `phase`, in order.
    pub fn terminal(&self, phase: Phase) -> Vec<CommandStatus> {
        self.lines().into_iter().filter(|l| l.phase == phase).filter_map(|l| l.status).collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, phase: Phase, text: &str, level: LogLevel, status: Option<CommandStatus>) {
        TracingSink.log(phase, text, level, status);
        if let Ok(mut l) = self.lines.lock() {
            l.push(LogLine { phase, text: text.to_string(), level, status });
        }
    }
}

/// An open phase. Ends with exactly one terminal line.
pub struct PhaseLog<'a> {
    sink: &'a dyn LogSink,
    phase: Phase,
    started: Instant,
}

impl<'a> PhaseLog<'a> {
    pub fn begin(sink: &'a dyn LogSink, phase: Phase) -> Self {
        sink.info(phase, &format!("Starting {}", phase));
        Self { sink, phase, started: Instant::now() }
    }

    fn elapsed(&self) {
        histogram!("rollout_phase_ms", self.started.elapsed().as_secs_f64() * 1000.0, "phase" => self.phase.as_str());
    }

    pub fn succeed(self, text: &str) {
        self.elapsed();
        self.sink.log(self.phase, text, LogLevel::Info, Some(CommandStatus::Success));
    }

    pub fn fail(self, err: RolloutError) -> RolloutError {
        self.elapsed();
        self.sink.log(self.phase, &err.to_string(), LogLevel::Error, Some(CommandStatus::Failure));
        err
    }
}

/// Run one phase body between its start and terminal lines.
pub async fn run_phase<T, F>(sink: &dyn LogSink, phase: Phase, body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let log = PhaseLog::begin(sink, phase);
    match body.await {
        Ok(v) => {
            log.succeed("Done.");
            Ok(v)
        }
        Err(e) => Err(log.fail(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phase_emits_one_terminal_line() {
        let sink = MemorySink::new();
        let ok: Result<u32> = run_phase(&sink, Phase::Apply, async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        let err: Result<()> = run_phase(&sink, Phase::WrapUp, async { Err(RolloutError::Apply("nope".into())) }).await;
        assert!(err.is_err());
        assert_eq!(sink.terminal(Phase::Apply), vec![CommandStatus::Success]);
        assert_eq!(sink.terminal(Phase::WrapUp), vec![CommandStatus::Failure]);
        assert_eq!(sink.texts(Phase::Apply)[0], "Starting Apply");
        assert!(sink.contains("apply failed: nope"));
    }
}
