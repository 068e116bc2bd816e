//! In-memory storage backend (no persistence)
//!
//! Used for `{"backend": "none"}` and throughout the tests. Everything lives
//! behind one `RwLock`; nothing survives the process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::StorageResult;
use super::schema::{MachineRecord, ToolRecord};

#[derive(Default)]
struct Tables {
    /// Keyed by machine id so loads come back ordered
    current: BTreeMap<String, MachineRecord>,
    history: Vec<MachineRecord>,
    tools: Vec<ToolRecord>,
    forecast: BTreeMap<String, MachineRecord>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load_current(&self) -> StorageResult<Vec<MachineRecord>> {
        Ok(self.tables.read().await.current.values().cloned().collect())
    }

    async fn replace_current(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.current = rows
            .into_iter()
            .map(|row| (row.machine_id.clone(), row))
            .collect();
        Ok(())
    }

    async fn latest_history(&self) -> StorageResult<Vec<MachineRecord>> {
        let tables = self.tables.read().await;
        let mut latest = BTreeMap::new();
        // later rows overwrite earlier ones
        for row in &tables.history {
            latest.insert(row.machine_id.clone(), row.clone());
        }
        Ok(latest.into_values().collect())
    }

    async fn append_history(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        debug!("in-memory backend: appending {} history rows", rows.len());
        self.tables.write().await.history.extend(rows);
        Ok(())
    }

    async fn query_history(
        &self,
        machine_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<MachineRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .rev()
            .filter(|row| row.machine_id == machine_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_tools(&self) -> StorageResult<Vec<ToolRecord>> {
        let tables = self.tables.read().await;
        let mut latest = BTreeMap::new();
        for row in &tables.tools {
            latest.insert(
                (row.machine_id.clone(), row.tool_number.clone()),
                row.clone(),
            );
        }
        Ok(latest.into_values().collect())
    }

    async fn append_tool_history(&self, rows: Vec<ToolRecord>) -> StorageResult<()> {
        self.tables.write().await.tools.extend(rows);
        Ok(())
    }

    async fn query_tool_history(&self, machine_id: &str) -> StorageResult<Vec<ToolRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tools
            .iter()
            .filter(|row| row.machine_id == machine_id)
            .cloned()
            .collect())
    }

    async fn replace_forecast(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.forecast = rows
            .into_iter()
            .map(|row| (row.machine_id.clone(), row))
            .collect();
        Ok(())
    }

    async fn load_forecast(&self) -> StorageResult<Vec<MachineRecord>> {
        Ok(self.tables.read().await.forecast.values().cloned().collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let tables = self.tables.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("history_rows".to_string(), tables.history.len().to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let tables = self.tables.read().await;
        Ok(format!(
            "In-Memory: {} machines, {} history rows, {} tool rows",
            tables.current.len(),
            tables.history.len(),
            tables.tools.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
