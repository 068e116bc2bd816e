//! Storage backend trait definition

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::StorageResult;
use super::schema::{MachineRecord, ToolRecord};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for the store a cycle reads from and writes to
///
/// Every method is called strictly after the poll join barrier, one at a
/// time, so implementations only need to be safe to share, not to
/// coordinate concurrent writers.
///
/// ## Read contract
///
/// The reconciler only ever needs "latest row per machine" (from `history`)
/// and "latest row per `(machine, tool_number)`" (from `tool_history`), plus
/// the whole current view.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Every row of the current view, ordered by machine id
    async fn load_current(&self) -> StorageResult<Vec<MachineRecord>>;

    /// Replace the current view wholesale
    ///
    /// Idempotent: writing the same rows twice leaves the same view.
    async fn replace_current(&self, rows: Vec<MachineRecord>) -> StorageResult<()>;

    /// The most recent history row of each machine
    async fn latest_history(&self) -> StorageResult<Vec<MachineRecord>>;

    async fn append_history(&self, rows: Vec<MachineRecord>) -> StorageResult<()>;

    /// History of one machine, newest first
    async fn query_history(&self, machine_id: &str, limit: usize)
    -> StorageResult<Vec<MachineRecord>>;

    /// The most recent row of each `(machine_id, tool_number)`
    async fn latest_tools(&self) -> StorageResult<Vec<ToolRecord>>;

    async fn append_tool_history(&self, rows: Vec<ToolRecord>) -> StorageResult<()>;

    /// Tool history of one machine, oldest first
    async fn query_tool_history(&self, machine_id: &str) -> StorageResult<Vec<ToolRecord>>;

    /// Replace the stale projection wholesale
    async fn replace_forecast(&self, rows: Vec<MachineRecord>) -> StorageResult<()>;

    async fn load_forecast(&self) -> StorageResult<Vec<MachineRecord>>;

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable row counts
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
