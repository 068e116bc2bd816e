//! Notifier - out-of-band alerts for machines that stopped or raised an alarm
//!
//! [`NotifyPolicy`] decides *whether* a machine is alerted this cycle;
//! an [`AlertSink`] decides *how*. Delivery is best-effort: every failure is
//! logged and counted, none of them reach the caller.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::StatusCode;
use crate::config::{NotifierConfig, QuietWindowConfig, SinkConfig};
use crate::storage::MachineRecord;

#[derive(Debug)]
pub enum NotifyError {
    /// No sound asset for this machine and alert class
    MissingAsset(PathBuf),

    /// The player could not be started or exited unsuccessfully
    PlayerFailed(String),

    /// The player did not finish in time and was killed
    PlayerTimeout(Duration),

    /// Remote delivery failed
    Delivery(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::MissingAsset(path) => write!(f, "missing alert asset {}", path.display()),
            NotifyError::PlayerFailed(msg) => write!(f, "alert player failed: {msg}"),
            NotifyError::PlayerTimeout(after) => {
                write!(f, "alert player timed out after {}ms", after.as_millis())
            }
            NotifyError::Delivery(msg) => write!(f, "alert delivery failed: {msg}"),
        }
    }
}

impl std::error::Error for NotifyError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertClass {
    /// Idle or starting
    Stopped,
    Alarm,
}

impl AlertClass {
    /// `None` for statuses that never alert (running, unknown, stale).
    pub fn for_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::ALARM => Some(AlertClass::Alarm),
            StatusCode::IDLE | StatusCode::STARTING => Some(AlertClass::Stopped),
            _ => None,
        }
    }

    /// Asset name, e.g. `CNC07_stopped`.
    pub fn asset_name(self, machine_id: &str) -> String {
        format!("{machine_id}_{self}")
    }
}

impl fmt::Display for AlertClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertClass::Stopped => write!(f, "stopped"),
            AlertClass::Alarm => write!(f, "alarm"),
        }
    }
}

/// Do-not-disturb window `[start, end)` in local time. A window whose end
/// is before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

impl From<QuietWindowConfig> for QuietWindow {
    fn from(config: QuietWindowConfig) -> Self {
        Self {
            start: config.start,
            end: config.end,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifyPolicy {
    /// `None` means every machine
    pub enabled: Option<HashSet<String>>,
    pub quiet_window: Option<QuietWindow>,
}

impl NotifyPolicy {
    pub fn from_config(config: &NotifierConfig) -> Self {
        Self {
            enabled: config.enabled_machines.clone(),
            quiet_window: config.quiet_window.map(QuietWindow::from),
        }
    }

    pub fn is_enabled(&self, machine_id: &str) -> bool {
        self.enabled
            .as_ref()
            .is_none_or(|enabled| enabled.contains(machine_id))
    }

    pub fn is_quiet(&self, now: NaiveTime) -> bool {
        self.quiet_window.is_some_and(|w| w.contains(now))
    }

    /// The alert to raise for this machine right now, if any.
    pub fn check(&self, machine_id: &str, status: StatusCode, now: NaiveTime) -> Option<AlertClass> {
        let class = AlertClass::for_status(status)?;
        if !self.is_enabled(machine_id) {
            trace!("{machine_id}: alerts disabled");
            return None;
        }
        if self.is_quiet(now) {
            debug!("{machine_id}: {class} suppressed during quiet window");
            return None;
        }
        Some(class)
    }
}

/// Out-of-band alert delivery
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(
        &self,
        machine_id: &str,
        class: AlertClass,
        status: StatusCode,
    ) -> Result<(), NotifyError>;
}

/// Only logs
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn alert(
        &self,
        machine_id: &str,
        class: AlertClass,
        status: StatusCode,
    ) -> Result<(), NotifyError> {
        info!("ALERT {machine_id}: {class} ({status})");
        Ok(())
    }
}

/// Plays `{asset_dir}/{machine}_{class}.{extension}` through an external player
#[derive(Debug, Clone)]
pub struct CommandSink {
    pub player: String,
    pub args: Vec<String>,
    pub asset_dir: PathBuf,
    pub extension: String,
    pub timeout: Duration,
}

impl CommandSink {
    pub fn asset_path(&self, machine_id: &str, class: AlertClass) -> PathBuf {
        self.asset_dir
            .join(format!("{}.{}", class.asset_name(machine_id), self.extension))
    }
}

#[async_trait]
impl AlertSink for CommandSink {
    #[instrument(skip(self))]
    async fn alert(
        &self,
        machine_id: &str,
        class: AlertClass,
        _status: StatusCode,
    ) -> Result<(), NotifyError> {
        let asset = self.asset_path(machine_id, class);
        if !asset.is_file() {
            return Err(NotifyError::MissingAsset(asset));
        }

        let mut child = tokio::process::Command::new(&self.player)
            .args(&self.args)
            .arg(&asset)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NotifyError::PlayerFailed(format!("{}: {e}", self.player)))?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(NotifyError::PlayerFailed(format!(
                "{} exited with {status}",
                self.player
            ))),
            Ok(Err(e)) => Err(NotifyError::PlayerFailed(e.to_string())),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill alert player: {e}");
                }
                Err(NotifyError::PlayerTimeout(self.timeout))
            }
        }
    }
}

/// POSTs a JSON payload per alert
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    #[instrument(skip(self))]
    async fn alert(
        &self,
        machine_id: &str,
        class: AlertClass,
        status: StatusCode,
    ) -> Result<(), NotifyError> {
        let payload = json!({
            "machine": machine_id,
            "alert": class.to_string(),
            "status": status.0,
            "asset": class.asset_name(machine_id),
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Delivery(format!(
                "webhook answered {}",
                response.status()
            )))
        }
    }
}

pub fn sink_from_config(config: &SinkConfig) -> Arc<dyn AlertSink> {
    match config {
        SinkConfig::None => Arc::new(LogSink),
        SinkConfig::Command {
            player,
            args,
            asset_dir,
            extension,
            timeout_secs,
        } => Arc::new(CommandSink {
            player: player.clone(),
            args: args.clone(),
            asset_dir: asset_dir.clone(),
            extension: extension.clone(),
            timeout: Duration::from_secs(*timeout_secs),
        }),
        SinkConfig::Webhook { url } => Arc::new(WebhookSink::new(url.clone())),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Alerts left out because the cycle's notify budget ran out
    pub skipped: usize,
}

pub struct Notifier {
    policy: NotifyPolicy,
    sink: Arc<dyn AlertSink>,
    inter_alert_delay: Duration,
    budget: Option<Duration>,
}

impl Notifier {
    pub fn new(policy: NotifyPolicy, sink: Arc<dyn AlertSink>, inter_alert_delay: Duration) -> Self {
        Self {
            policy,
            sink,
            inter_alert_delay,
            budget: None,
        }
    }

    /// Stop starting alerts once `budget` has passed since the first one.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn from_config(config: &NotifierConfig) -> Self {
        Self::new(
            NotifyPolicy::from_config(config),
            sink_from_config(&config.sink),
            Duration::from_secs(config.inter_alert_delay_secs),
        )
        .with_budget(config.notify_budget())
    }

    /// Alert every machine of the cycle that needs it, one after another,
    /// within the notify budget.
    pub async fn notify_cycle(&self, records: &[MachineRecord], now: NaiveTime) -> NotifySummary {
        let mut summary = NotifySummary::default();
        let started = tokio::time::Instant::now();

        for record in records {
            let Some(class) = self.policy.check(&record.machine_id, record.status, now) else {
                continue;
            };

            let next_start = started.elapsed()
                + if summary.attempted > 0 {
                    self.inter_alert_delay
                } else {
                    Duration::ZERO
                };
            if self.budget.is_some_and(|budget| next_start > budget) {
                trace!("no notify budget left for {}", record.machine_id);
                summary.skipped += 1;
                continue;
            }

            if summary.attempted > 0 && !self.inter_alert_delay.is_zero() {
                tokio::time::sleep(self.inter_alert_delay).await;
            }
            summary.attempted += 1;

            match self.sink.alert(&record.machine_id, class, record.status).await {
                Ok(()) => {
                    debug!("alerted {}: {class}", record.machine_id);
                    summary.delivered += 1;
                }
                Err(e) => {
                    error!("alert for {} failed: {e}", record.machine_id);
                    summary.failed += 1;
                }
            }
        }

        if summary.skipped > 0 {
            warn!(
                "notify budget of {}s spent, {} alerts skipped",
                self.budget.unwrap_or_default().as_secs(),
                summary.skipped
            );
        }
        summary
    }
}
