use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    ConfigMap,
    Sqlite,
}

impl std::str::FromStr for HistoryBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "configmap" => Ok(HistoryBackend::ConfigMap),
            "sqlite" => Ok(HistoryBackend::Sqlite),
            other => Err(format!("unknown history backend {:?} (expect configmap or sqlite)", other)),
        }
    }
}

/// Engine settings, read once from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    /// Reject ledger saves when the document changed since it was loaded.
    pub ledger_cas: bool,
    pub history_backend: HistoryBackend,
    pub field_manager: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            default_timeout: Duration::from_secs(600),
            ledger_cas: false,
            history_backend: HistoryBackend::ConfigMap,
            field_manager: "drover".to_string(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("on"))
        .unwrap_or(false)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: std::env::var("DROVER_POLL_MILLIS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            default_timeout: std::env::var("DROVER_DEFAULT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(d.default_timeout),
            ledger_cas: env_flag("DROVER_LEDGER_CAS"),
            history_backend: std::env::var("DROVER_HISTORY_BACKEND")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(d.history_backend),
            field_manager: std::env::var("DROVER_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
        }
    }

    /// Task timeout if given, else the configured default.
    pub fn timeout(&self, secs: Option<u64>) -> Duration {
        secs.map(Duration::from_secs).unwrap_or(self.default_timeout)
    }
}
