//! Persister - writes a reconciled cycle through a [`StorageBackend`]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::reconciler::Reconciliation;
use crate::storage::{MachineRecord, StorageBackend, StorageResult, ToolRecord};

/// What a cycle read back before reconciling
#[derive(Debug, Clone, Default)]
pub struct PreviousState {
    pub current: Vec<MachineRecord>,
    pub latest_history: Vec<MachineRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub current_rows: usize,
    pub history_rows: usize,
    pub tool_rows: usize,
    pub stale_rows: usize,
}

pub struct Persister {
    backend: Arc<dyn StorageBackend>,
}

impl Persister {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub async fn load_previous(&self) -> StorageResult<PreviousState> {
        Ok(PreviousState {
            current: self.backend.load_current().await?,
            latest_history: self.backend.latest_history().await?,
        })
    }

    /// Wholesale replace; runs every cycle whatever the diff says.
    pub async fn replace_current_view(&self, rows: Vec<MachineRecord>) -> StorageResult<usize> {
        let count = rows.len();
        self.backend.replace_current(rows).await?;
        Ok(count)
    }

    /// Append changed rows. An empty set writes nothing.
    pub async fn append_history(&self, changed: Vec<MachineRecord>) -> StorageResult<usize> {
        if changed.is_empty() {
            debug!("no changes, history untouched");
            return Ok(0);
        }
        let count = changed.len();
        self.backend.append_history(changed).await?;
        Ok(count)
    }

    /// Append only tool rows whose name differs from the latest stored one
    /// for the same `(machine, tool_number)`. Within a batch the last row per
    /// key wins.
    pub async fn append_tool_history(&self, candidates: Vec<ToolRecord>) -> StorageResult<usize> {
        if candidates.is_empty() {
            return Ok(0);
        }

        let stored = self.backend.latest_tools().await?;
        let latest: HashMap<(&str, &str), &str> = stored
            .iter()
            .map(|t| (t.key(), t.tool_name.as_str()))
            .collect();

        // only the last candidate per key counts
        let keep: Vec<bool> = {
            let mut last_index: HashMap<(&str, &str), usize> = HashMap::new();
            for (index, tool) in candidates.iter().enumerate() {
                last_index.insert(tool.key(), index);
            }
            candidates
                .iter()
                .enumerate()
                .map(|(index, tool)| {
                    last_index.get(&tool.key()) == Some(&index)
                        && latest.get(&tool.key()) != Some(&tool.tool_name.as_str())
                })
                .collect()
        };

        let fresh: Vec<ToolRecord> = candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(tool, keep)| keep.then_some(tool))
            .collect();

        let count = fresh.len();
        if count > 0 {
            self.backend.append_tool_history(fresh).await?;
        }
        Ok(count)
    }

    /// Publish the previous current view tagged stale.
    pub async fn publish_stale_projection(
        &self,
        previous: &[MachineRecord],
        timestamp: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let stale: Vec<MachineRecord> = previous.iter().map(|r| r.to_stale(timestamp)).collect();
        let count = stale.len();
        self.backend.replace_forecast(stale).await?;
        Ok(count)
    }

    /// Write one reconciled cycle: stale projection, current view, history,
    /// tool history.
    #[instrument(skip_all)]
    pub async fn persist(
        &self,
        reconciliation: &Reconciliation,
        previous: &PreviousState,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<PersistReport> {
        let stale_rows = self
            .publish_stale_projection(&previous.current, timestamp)
            .await?;
        let current_rows = self
            .replace_current_view(reconciliation.current.clone())
            .await?;
        let history_rows = self
            .append_history(reconciliation.changed_records())
            .await?;
        let tool_rows = self
            .append_tool_history(reconciliation.tools.clone())
            .await?;

        let report = PersistReport {
            current_rows,
            history_rows,
            tool_rows,
            stale_rows,
        };
        info!(
            current = report.current_rows,
            history = report.history_rows,
            tools = report.tool_rows,
            "cycle persisted"
        );
        Ok(report)
    }
}
