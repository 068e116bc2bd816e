use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveTime;
use tracing::trace;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence across cycles)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleet.db")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub fleet: FleetConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,
}

fn default_error_log() -> PathBuf {
    PathBuf::from("./errlog")
}

/// Where a machine's status ordinal comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// Tri-state signal tower (green / yellow / red)
    #[default]
    Lamp,
    /// Raw run-state ordinal reported by the controller
    RunState,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FleetConfig {
    /// First controller address (inclusive)
    pub first: Ipv4Addr,

    /// Last controller address (inclusive)
    pub last: Ipv4Addr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Offsets into the address range (0 = `first`) that are never polled
    #[serde(default)]
    pub excluded: Vec<usize>,

    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Upper bound on polls in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    #[serde(default)]
    pub status_source: StatusSource,

    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

impl FleetConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

fn default_port() -> u16 {
    8193
}

fn default_id_prefix() -> String {
    String::from("CNC")
}

fn default_concurrency() -> usize {
    16
}

fn default_poll_timeout() -> u64 {
    5
}

fn default_error_channel_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ReconcileConfig {
    /// How many consecutive cycles a missing field may be filled from the
    /// current view. `None` keeps backfilling for as long as the machine is
    /// silent.
    #[serde(default)]
    pub max_backfill_cycles: Option<u32>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NotifierConfig {
    /// Machines allowed to raise alerts. Absent means every machine.
    #[serde(default)]
    pub enabled_machines: Option<HashSet<String>>,

    /// Do-not-disturb window, local time. `null` disables it.
    #[serde(default = "default_quiet_window")]
    pub quiet_window: Option<QuietWindowConfig>,

    #[serde(default = "default_inter_alert_delay")]
    pub inter_alert_delay_secs: u64,

    /// Upper bound on the time one cycle spends alerting
    #[serde(default = "default_notify_budget")]
    pub notify_budget_secs: u64,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl NotifierConfig {
    pub fn notify_budget(&self) -> Duration {
        Duration::from_secs(self.notify_budget_secs)
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled_machines: None,
            quiet_window: default_quiet_window(),
            inter_alert_delay_secs: default_inter_alert_delay(),
            notify_budget_secs: default_notify_budget(),
            sink: SinkConfig::default(),
        }
    }
}

fn default_quiet_window() -> Option<QuietWindowConfig> {
    Some(QuietWindowConfig {
        start: NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default(),
        end: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default(),
    })
}

fn default_inter_alert_delay() -> u64 {
    3
}

fn default_notify_budget() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct QuietWindowConfig {
    #[serde(with = "hh_mm")]
    pub start: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end: NaiveTime,
}

/// Accepts `HH:MM` or `HH:MM:SS`.
mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, de::Error};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
            .map_err(|e| D::Error::custom(format!("invalid time '{raw}': {e}")))
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Alerts are only logged
    #[default]
    None,

    /// Play a sound asset through an external player
    Command {
        player: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_asset_dir")]
        asset_dir: PathBuf,
        #[serde(default = "default_asset_extension")]
        extension: String,
        #[serde(default = "default_player_timeout")]
        timeout_secs: u64,
    },

    /// POST a JSON payload
    Webhook { url: String },
}

fn default_asset_dir() -> PathBuf {
    PathBuf::from("./sounds")
}

fn default_asset_extension() -> String {
    String::from("wav")
}

fn default_player_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Time box for a single cycle execution
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Longest tolerated stretch without a successful cycle
    #[serde(default = "default_liveness_threshold")]
    pub liveness_threshold_secs: u64,

    /// Workers younger than this are never killed
    #[serde(default = "default_min_process_age")]
    pub min_process_age_secs: u64,

    #[serde(default = "default_max_uptime")]
    pub max_uptime_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    #[serde(default = "default_degraded_percent")]
    pub memory_degraded_percent: f32,

    #[serde(default = "default_degraded_percent")]
    pub disk_degraded_percent: f32,

    #[serde(default = "default_cleanup_after")]
    pub cleanup_after_failures: u32,

    #[serde(default = "default_restart_after")]
    pub restart_after_failures: u32,

    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,

    #[serde(default = "default_restart_grace")]
    pub restart_grace_secs: u64,

    /// Cycle executable. Defaults to `fleet-cycle` next to the supervisor.
    #[serde(default)]
    pub cycle_command: Option<PathBuf>,

    #[serde(default)]
    pub cycle_args: Vec<String>,

    /// Command-line fragment identifying cycle workers
    #[serde(default = "default_process_signature")]
    pub process_signature: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            cycle_timeout_secs: default_cycle_timeout(),
            liveness_threshold_secs: default_liveness_threshold(),
            min_process_age_secs: default_min_process_age(),
            max_uptime_secs: default_max_uptime(),
            health_interval_secs: default_health_interval(),
            memory_degraded_percent: default_degraded_percent(),
            disk_degraded_percent: default_degraded_percent(),
            cleanup_after_failures: default_cleanup_after(),
            restart_after_failures: default_restart_after(),
            backoff_secs: default_backoff(),
            restart_grace_secs: default_restart_grace(),
            cycle_command: None,
            cycle_args: Vec::new(),
            process_signature: default_process_signature(),
        }
    }
}

fn default_cycle_interval() -> u64 {
    10
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_liveness_threshold() -> u64 {
    300
}

fn default_min_process_age() -> u64 {
    60
}

fn default_max_uptime() -> u64 {
    24 * 60 * 60
}

fn default_health_interval() -> u64 {
    60
}

fn default_degraded_percent() -> f32 {
    90.0
}

fn default_cleanup_after() -> u32 {
    3
}

fn default_restart_after() -> u32 {
    10
}

fn default_backoff() -> u64 {
    60
}

fn default_restart_grace() -> u64 {
    5
}

fn default_process_signature() -> String {
    String::from("fleet-cycle")
}

/// Largest address range one cycle will poll
pub const MAX_FLEET_SIZE: u32 = 1024;

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_str(content).context("invalid configuration file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    let (first, last) = (config.fleet.first, config.fleet.last);
    if first > last {
        anyhow::bail!("address range is empty: {first} > {last}");
    }
    let size = u32::from(last) - u32::from(first);
    if size >= MAX_FLEET_SIZE {
        anyhow::bail!(
            "address range {first}..{last} spans {} addresses, more than {MAX_FLEET_SIZE}",
            u64::from(size) + 1
        );
    }

    let supervisor = &config.supervisor;
    if supervisor.cleanup_after_failures == 0 || supervisor.restart_after_failures == 0 {
        anyhow::bail!("failure thresholds must be at least 1");
    }
    if supervisor.restart_after_failures <= supervisor.cleanup_after_failures {
        anyhow::bail!(
            "restart_after_failures ({}) must be greater than cleanup_after_failures ({})",
            supervisor.restart_after_failures,
            supervisor.cleanup_after_failures
        );
    }

    if config.notifier.notify_budget_secs >= supervisor.cycle_timeout_secs {
        anyhow::bail!(
            "notify_budget_secs ({}) must be below cycle_timeout_secs ({})",
            config.notifier.notify_budget_secs,
            supervisor.cycle_timeout_secs
        );
    }
    Ok(())
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {path}"))?;
    parse_config(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}
