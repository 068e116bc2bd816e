pub mod aggregator;
pub mod config;
pub mod cycle;
pub mod errlog;
pub mod notifier;
pub mod persister;
pub mod poller;
pub mod protocol;
pub mod reconciler;
pub mod storage;
pub mod supervisor;
pub mod util;

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Single ordinal describing what a machine is doing.
///
/// Kept as an open integer because controllers can report values outside the
/// known set; [`StatusCode::normalize`] decides which of those are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub i64);

impl StatusCode {
    pub const IDLE: StatusCode = StatusCode(0);
    pub const STARTING: StatusCode = StatusCode(1);
    /// Legacy duplicate of [`StatusCode::RUNNING`].
    pub const HOLD: StatusCode = StatusCode(2);
    pub const RUNNING: StatusCode = StatusCode(3);
    pub const ALARM: StatusCode = StatusCode(4);
    /// Sentinel: unknown or unreachable this cycle.
    pub const UNKNOWN: StatusCode = StatusCode(9);
    /// Tag used for the last-known (stale) projection.
    pub const STALE: StatusCode = StatusCode(885);

    /// Coerce a raw reading into the status set the rest of the pipeline
    /// understands. `2` collapses into `3`; anything unrecognised is `None`.
    pub fn normalize(self) -> Option<StatusCode> {
        match self.0 {
            2 => Some(StatusCode::RUNNING),
            0 | 1 | 3 | 4 | 9 => Some(self),
            _ => None,
        }
    }

    /// Running and unknown never trigger an alert.
    pub fn is_nominal(self) -> bool {
        self == StatusCode::RUNNING || self == StatusCode::UNKNOWN
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            StatusCode::IDLE => "idle",
            StatusCode::STARTING => "starting",
            StatusCode::HOLD => "hold",
            StatusCode::RUNNING => "running",
            StatusCode::ALARM => "alarm",
            StatusCode::UNKNOWN => "unknown",
            StatusCode::STALE => "stale",
            _ => return write!(f, "raw({})", self.0),
        };
        write!(f, "{label}({})", self.0)
    }
}

/// One row of a program's tool table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub tool_number: String,
    pub tool_name: String,
}

/// Everything read from one machine in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub address: Ipv4Addr,
    pub status_code: StatusCode,
    pub part_count: Option<i64>,
    pub program_id: Option<String>,
    pub drawing_no: Option<String>,
    pub total_count: Option<i64>,
    pub ng_count: Option<i64>,
    /// `HH:MM:SS`
    pub cycle_time: Option<String>,
    pub tool_list: Vec<ToolEntry>,
    pub poll_duration_ms: u64,
    /// Set when part of the read degraded (e.g. the program header could not
    /// be parsed) without failing the whole poll.
    pub poll_error: Option<String>,
}

impl MachineSnapshot {
    /// Snapshot with every optional field absent.
    pub fn empty(machine_id: impl Into<String>, address: Ipv4Addr, status: StatusCode) -> Self {
        Self {
            machine_id: machine_id.into(),
            address,
            status_code: status,
            part_count: None,
            program_id: None,
            drawing_no: None,
            total_count: None,
            ng_count: None,
            cycle_time: None,
            tool_list: Vec::new(),
            poll_duration_ms: 0,
            poll_error: None,
        }
    }
}

/// Why a poll produced no snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollFailureKind {
    TimedOut,
    ConnectionRefused,
    OtherOsError,
    UnexpectedError,
}

impl fmt::Display for PollFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailureKind::TimedOut => write!(f, "timed out"),
            PollFailureKind::ConnectionRefused => write!(f, "connection refused"),
            PollFailureKind::OtherOsError => write!(f, "os error"),
            PollFailureKind::UnexpectedError => write!(f, "unexpected error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollFailure {
    pub machine_id: String,
    pub address: Ipv4Addr,
    pub kind: PollFailureKind,
    pub message: String,
    pub poll_duration_ms: u64,
}

/// Result of polling one endpoint: exactly one per non-excluded address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Snapshot(MachineSnapshot),
    Failed(PollFailure),
}

impl PollOutcome {
    pub fn machine_id(&self) -> &str {
        match self {
            PollOutcome::Snapshot(s) => &s.machine_id,
            PollOutcome::Failed(f) => &f.machine_id,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        match self {
            PollOutcome::Snapshot(s) => s.address,
            PollOutcome::Failed(f) => f.address,
        }
    }

    /// Failures always report the sentinel.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PollOutcome::Snapshot(s) => s.status_code,
            PollOutcome::Failed(_) => StatusCode::UNKNOWN,
        }
    }

    pub fn poll_duration_ms(&self) -> u64 {
        match self {
            PollOutcome::Snapshot(s) => s.poll_duration_ms,
            PollOutcome::Failed(f) => f.poll_duration_ms,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PollOutcome::Failed(_))
    }

    /// Project the outcome onto a snapshot. A failure becomes a snapshot with
    /// the sentinel status and every optional field absent.
    pub fn to_snapshot(&self) -> MachineSnapshot {
        match self {
            PollOutcome::Snapshot(s) => s.clone(),
            PollOutcome::Failed(f) => {
                let mut snapshot =
                    MachineSnapshot::empty(f.machine_id.clone(), f.address, StatusCode::UNKNOWN);
                snapshot.poll_duration_ms = f.poll_duration_ms;
                snapshot.poll_error = Some(format!("{}: {}", f.kind, f.message));
                snapshot
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalize_collapses_hold_into_running() {
        assert_eq!(StatusCode(2).normalize(), Some(StatusCode::RUNNING));
        assert_eq!(StatusCode(3).normalize(), Some(StatusCode::RUNNING));
    }

    #[test]
    fn test_status_normalize_drops_garbled_values() {
        assert_eq!(StatusCode(999).normalize(), None);
        assert_eq!(StatusCode(-1).normalize(), None);
        assert_eq!(StatusCode::STALE.normalize(), None);
    }

    #[test]
    fn test_status_nominal() {
        assert!(StatusCode::RUNNING.is_nominal());
        assert!(StatusCode::UNKNOWN.is_nominal());
        assert!(!StatusCode::ALARM.is_nominal());
        assert!(!StatusCode::IDLE.is_nominal());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::ALARM.to_string(), "alarm(4)");
        assert_eq!(StatusCode(42).to_string(), "raw(42)");
    }

    #[test]
    fn test_failure_projects_to_sentinel_snapshot() {
        let outcome = PollOutcome::Failed(PollFailure {
            machine_id: "CNC02".to_string(),
            address: Ipv4Addr::new(192, 168, 1, 169),
            kind: PollFailureKind::TimedOut,
            message: "socket timeout".to_string(),
            poll_duration_ms: 5000,
        });

        let snapshot = outcome.to_snapshot();
        assert_eq!(snapshot.status_code, StatusCode::UNKNOWN);
        assert_eq!(snapshot.part_count, None);
        assert_eq!(snapshot.total_count, None);
        assert!(snapshot.tool_list.is_empty());
        assert_eq!(snapshot.poll_error.as_deref(), Some("timed out: socket timeout"));
        assert_eq!(outcome.status_code(), StatusCode::UNKNOWN);
    }
}
