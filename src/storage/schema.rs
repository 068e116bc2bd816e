//! Row definitions shared by every storage backend
//!
//! ## Tables
//!
//! - `current_state`: one [`MachineRecord`] per machine, replaced wholesale
//!   every cycle
//! - `history`: append-only [`MachineRecord`]s, one per changed snapshot
//! - `forecast`: the previous current view re-tagged with
//!   [`StatusCode::STALE`], replaced wholesale every cycle
//! - `tool_history`: append-only [`ToolRecord`]s, deduplicated per
//!   `(machine_id, tool_number)`
//!
//! Diagnostics (`poll_duration_ms`, `poll_error`) never reach storage.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MachineSnapshot, StatusCode};

/// One machine as written to `current_state`, `history` or `forecast`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub machine_id: String,
    pub address: Ipv4Addr,
    pub status: StatusCode,
    pub part_count: Option<i64>,
    pub program_id: Option<String>,
    pub drawing_no: Option<String>,
    pub total_count: Option<i64>,
    pub ng_count: Option<i64>,
    pub cycle_time: Option<String>,

    /// When the cycle that produced this row ran (always UTC)
    pub timestamp: DateTime<Utc>,

    /// Consecutive cycles in which at least one field of this row was
    /// carried over from the previous current view
    pub backfill_age: u32,
}

impl MachineRecord {
    /// Build a row from a snapshot whose status has already been normalized.
    pub fn from_snapshot(
        snapshot: &MachineSnapshot,
        status: StatusCode,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            machine_id: snapshot.machine_id.clone(),
            address: snapshot.address,
            status,
            part_count: snapshot.part_count,
            program_id: snapshot.program_id.clone(),
            drawing_no: snapshot.drawing_no.clone(),
            total_count: snapshot.total_count,
            ng_count: snapshot.ng_count,
            cycle_time: snapshot.cycle_time.clone(),
            timestamp,
            backfill_age: 0,
        }
    }

    /// Copy of this row tagged as last-known
    pub fn to_stale(&self, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: StatusCode::STALE,
            timestamp,
            ..self.clone()
        }
    }
}

/// One observation of a tool slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub machine_id: String,
    pub tool_number: String,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
}

impl ToolRecord {
    pub fn from_snapshot(snapshot: &MachineSnapshot, timestamp: DateTime<Utc>) -> Vec<Self> {
        snapshot
            .tool_list
            .iter()
            .map(|tool| Self {
                machine_id: snapshot.machine_id.clone(),
                tool_number: tool.tool_number.clone(),
                tool_name: tool.tool_name.clone(),
                timestamp,
            })
            .collect()
    }

    /// Dedup key
    pub fn key(&self) -> (&str, &str) {
        (&self.machine_id, &self.tool_number)
    }
}
