//! One full cycle: poll every machine, reconcile, persist, alert.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, instrument, warn};

use crate::MachineSnapshot;
use crate::aggregator::{Aggregator, CyclePlan};
use crate::config::Config;
use crate::errlog::ErrorLog;
use crate::notifier::{NotifySummary, Notifier};
use crate::persister::{PersistReport, Persister};
use crate::poller::Poller;
use crate::protocol::ProtocolConnector;
use crate::reconciler::Reconciler;
use crate::storage::{StorageBackend, open_backend};
use crate::util::get_db_path;

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub polled: usize,
    pub failed: usize,
    /// Machines left out because their status could not be coerced
    pub dropped_statuses: usize,
    pub changed: usize,
    pub persist: PersistReport,
    pub notify: NotifySummary,
    pub errors_logged: usize,
    pub dropped_errors: usize,
    pub duration: Duration,
}

pub struct FleetCycle {
    plan: CyclePlan,
    aggregator: Aggregator,
    reconciler: Reconciler,
    persister: Persister,
    notifier: Notifier,
    error_log: ErrorLog,
}

impl FleetCycle {
    pub fn new(
        plan: CyclePlan,
        aggregator: Aggregator,
        reconciler: Reconciler,
        persister: Persister,
        notifier: Notifier,
        error_log: ErrorLog,
    ) -> Self {
        Self {
            plan,
            aggregator,
            reconciler,
            persister,
            notifier,
            error_log,
        }
    }

    /// Wire a cycle from configuration and an already opened backend.
    pub fn with_backend(
        config: &Config,
        connector: Arc<dyn ProtocolConnector>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let poller = Poller::from_config(connector, &config.fleet);
        Self::new(
            CyclePlan::from_config(&config.fleet),
            Aggregator::from_config(poller, &config.fleet),
            Reconciler::new(config.reconcile.max_backfill_cycles),
            Persister::new(backend),
            Notifier::from_config(&config.notifier),
            ErrorLog::new(config.error_log.clone()),
        )
    }

    pub async fn from_config(
        config: &Config,
        connector: Arc<dyn ProtocolConnector>,
    ) -> anyhow::Result<Self> {
        let backend = open_backend(&config.storage, get_db_path())
            .await
            .context("failed to open storage")?;
        let health = backend
            .health_check()
            .await
            .context("storage health check failed")?;
        if !health.healthy {
            anyhow::bail!("storage is not usable: {}", health.message);
        }
        debug!("storage ready: {}", health.message);
        Ok(Self::with_backend(config, connector, backend))
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        self.persister.backend()
    }

    pub async fn run(&self) -> anyhow::Result<CycleReport> {
        self.run_at(Local::now()).await
    }

    /// Run one cycle as if the wall clock read `now`.
    #[instrument(skip_all, fields(at = %now.format("%H:%M:%S")))]
    pub async fn run_at(&self, now: DateTime<Local>) -> anyhow::Result<CycleReport> {
        let started = Instant::now();
        let timestamp = now.with_timezone(&Utc);

        let results = self.aggregator.run_cycle(&self.plan).await;
        let snapshots: Vec<MachineSnapshot> =
            results.table.outcomes().map(|o| o.to_snapshot()).collect();

        let previous = self
            .persister
            .load_previous()
            .await
            .context("failed to read previous state")?;

        let reconciliation = self.reconciler.reconcile(
            &snapshots,
            &previous.current,
            &previous.latest_history,
            timestamp,
        );

        let persist = self
            .persister
            .persist(&reconciliation, &previous, timestamp)
            .await
            .context("failed to persist cycle")?;

        let notify = self
            .notifier
            .notify_cycle(&reconciliation.current, now.time())
            .await;

        let mut messages = results.errors;
        messages.extend(reconciliation.dropped.iter().map(|d| {
            format!("{}: unusable status {}, reading dropped", d.machine_id, d.raw_status)
        }));
        if results.dropped_errors > 0 {
            messages.push(format!(
                "{} further poll errors dropped (error channel full)",
                results.dropped_errors
            ));
        }
        if let Err(e) = self.error_log.append(now, &messages).await {
            warn!(
                "failed to write error log {}: {e}",
                self.error_log.path().display()
            );
        }

        let report = CycleReport {
            polled: results.table.len(),
            failed: results.table.failures(),
            dropped_statuses: reconciliation.dropped.len(),
            changed: reconciliation.changed.len(),
            persist,
            notify,
            errors_logged: messages.len(),
            dropped_errors: results.dropped_errors,
            duration: started.elapsed(),
        };

        info!(
            polled = report.polled,
            failed = report.failed,
            changed = report.changed,
            alerts = report.notify.attempted,
            duration_ms = report.duration.as_millis() as u64,
            "cycle complete"
        );
        Ok(report)
    }
}
