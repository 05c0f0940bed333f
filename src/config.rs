//! Runtime configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The config key prefix stripped from the INIT aggregated configs.
const SERVER_PREFIX: &str = "SERVER_";

/// Process level runtime configuration data, read from the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port on which the control protocol is served.
    pub service_port: u16,
    /// The port on which prometheus metrics are served, `0` disables the server.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// Seconds without a heartbeat after which the worker shuts itself down, `0` disables.
    #[serde(default = "Config::default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,
    /// The maximum number of requests dispatched concurrently.
    #[serde(default = "Config::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    fn default_heartbeat_timeout_seconds() -> u64 {
        60
    }

    fn default_max_concurrent_requests() -> usize {
        16
    }

    /// The heartbeat timeout, if the heartbeat monitor is enabled.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        match self.heartbeat_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Build a config instance for testing.
    #[cfg(test)]
    pub fn new_test() -> Result<std::sync::Arc<Self>> {
        Ok(std::sync::Arc::new(Self {
            rust_log: "error".into(),
            service_port: 0,
            metrics_port: 0,
            heartbeat_timeout_seconds: 0,
            max_concurrent_requests: 4,
        }))
    }
}

/// The mode in which consumption runs.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    /// Consumption runs inside the main server process.
    Builtin,
    /// Consumption runs inside this isolated worker process.
    Isolated,
}

/// Ingestion configuration delivered by the supervising process with the INIT action.
#[derive(Clone, Debug, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "IngestionConfig::default_ingestion_mode")]
    pub ingestion_mode: IngestionMode,
    /// The port on which the supervising process accepts reports.
    #[serde(default = "IngestionConfig::default_application_port")]
    pub application_port: u16,
    /// The path to the storage engine's data on disk.
    pub storage_data_path: String,
    #[serde(default = "IngestionConfig::default_leaked_resource_cleanup_interval_ms")]
    pub leaked_resource_cleanup_interval_ms: u64,
    #[serde(default = "IngestionConfig::default_stop_consumption_wait_interval_ms")]
    pub stop_consumption_wait_interval_ms: u64,
    #[serde(default = "IngestionConfig::default_stop_consumption_wait_retries")]
    pub stop_consumption_wait_retries: u32,
    /// The capacity of the outbound report channel.
    #[serde(default = "IngestionConfig::default_report_channel_capacity")]
    pub report_channel_capacity: usize,
    /// Comma separated names of the metric collectors to register.
    #[serde(default = "IngestionConfig::default_metric_collectors")]
    pub metric_collectors: String,
    /// The catch-up timeout used for stores which do not configure their own.
    #[serde(default = "IngestionConfig::default_bootstrap_to_online_timeout_hours")]
    pub bootstrap_to_online_timeout_hours: u64,
}

impl IngestionConfig {
    /// Build an instance from the aggregated configs of an INIT action.
    ///
    /// Keys such as `server.ingestion.mode` are normalized to `INGESTION_MODE` before being
    /// deserialized. Unknown keys are ignored.
    pub fn from_aggregated(configs: &HashMap<String, String>) -> Result<Self> {
        let vars = configs.iter().map(|(key, val)| (Self::normalize_key(key), val.clone()));
        envy::from_iter(vars).context("error building ingestion config from aggregated configs")
    }

    fn normalize_key(key: &str) -> String {
        let key = key.to_ascii_uppercase().replace(|c: char| c == '.' || c == '-', "_");
        match key.strip_prefix(SERVER_PREFIX) {
            Some(stripped) => stripped.to_string(),
            None => key,
        }
    }

    fn default_ingestion_mode() -> IngestionMode {
        IngestionMode::Builtin
    }

    fn default_application_port() -> u16 {
        27015
    }

    fn default_leaked_resource_cleanup_interval_ms() -> u64 {
        10 * 60 * 1000
    }

    fn default_stop_consumption_wait_interval_ms() -> u64 {
        1000
    }

    fn default_stop_consumption_wait_retries() -> u32 {
        30
    }

    fn default_report_channel_capacity() -> usize {
        1000
    }

    fn default_metric_collectors() -> String {
        "process,transitions,storage,service".into()
    }

    fn default_bootstrap_to_online_timeout_hours() -> u64 {
        24
    }

    pub fn leaked_resource_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.leaked_resource_cleanup_interval_ms)
    }

    pub fn stop_consumption_wait_interval(&self) -> Duration {
        Duration::from_millis(self.stop_consumption_wait_interval_ms)
    }

    /// The names of all configured metric collectors.
    pub fn metric_collector_names(&self) -> impl Iterator<Item = &str> {
        self.metric_collectors.split(',').map(str::trim)
    }

    /// Build an ingestion config for testing.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                ingestion_mode: IngestionMode::Isolated,
                application_port: 0,
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                leaked_resource_cleanup_interval_ms: 1000,
                stop_consumption_wait_interval_ms: 1000,
                stop_consumption_wait_retries: 3,
                report_channel_capacity: 100,
                metric_collectors: "transitions,storage,service".into(),
                bootstrap_to_online_timeout_hours: 24,
            }),
            tmpdir,
        ))
    }
}
