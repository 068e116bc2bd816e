//! Reconciler - decides what a cycle's results mean for storage
//!
//! Per machine, in order:
//!
//! 1. coerce the status (`2` becomes `3`, unknown values drop the machine for
//!    this cycle)
//! 2. backfill `total_count` / `ng_count` from the current view
//! 3. diff the tracked fields against the machine's latest history row
//! 4. backfill `part_count`, `program_id`, `drawing_no` and `cycle_time` from
//!    the current view, for the new current view only
//!
//! Step 4 happens after the diff so that a counter disappearing still shows up
//! as a change in history while the current view keeps the last known value.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::MachineSnapshot;
use crate::storage::{MachineRecord, ToolRecord};

/// Fields whose change produces a history row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedField {
    Status,
    PartCount,
    ProgramId,
    DrawingNo,
    TotalCount,
    NgCount,
}

impl TrackedField {
    pub const ALL: [TrackedField; 6] = [
        TrackedField::Status,
        TrackedField::PartCount,
        TrackedField::ProgramId,
        TrackedField::DrawingNo,
        TrackedField::TotalCount,
        TrackedField::NgCount,
    ];

    fn differs(self, current: &MachineRecord, previous: &MachineRecord) -> bool {
        match self {
            TrackedField::Status => current.status != previous.status,
            TrackedField::PartCount => !null_aware_eq(&current.part_count, &previous.part_count),
            TrackedField::ProgramId => !null_aware_eq(&current.program_id, &previous.program_id),
            TrackedField::DrawingNo => !null_aware_eq(&current.drawing_no, &previous.drawing_no),
            TrackedField::TotalCount => {
                !null_aware_eq(&current.total_count, &previous.total_count)
            }
            TrackedField::NgCount => !null_aware_eq(&current.ng_count, &previous.ng_count),
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackedField::Status => "status",
            TrackedField::PartCount => "part_count",
            TrackedField::ProgramId => "program_id",
            TrackedField::DrawingNo => "drawing_no",
            TrackedField::TotalCount => "total_count",
            TrackedField::NgCount => "ng_count",
        };
        f.write_str(name)
    }
}

/// Equal iff both absent, or both present and equal. Present vs absent is
/// always a difference.
pub fn null_aware_eq<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Tracked fields that differ. Empty means "no history row".
pub fn diff(current: &MachineRecord, previous: &MachineRecord) -> Vec<TrackedField> {
    TrackedField::ALL
        .into_iter()
        .filter(|field| field.differs(current, previous))
        .collect()
}

/// One history row to append
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub record: MachineRecord,
    /// Empty for a machine seen for the first time
    pub fields: Vec<TrackedField>,
    pub first_seen: bool,
}

/// A machine left out of this cycle because its status could not be coerced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedReading {
    pub machine_id: String,
    pub raw_status: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// New current view, one row per machine that survived coercion
    pub current: Vec<MachineRecord>,
    pub changed: Vec<Change>,
    pub dropped: Vec<DroppedReading>,
    /// Tool observations, not yet deduplicated against storage
    pub tools: Vec<ToolRecord>,
}

impl Reconciliation {
    pub fn changed_records(&self) -> Vec<MachineRecord> {
        self.changed.iter().map(|c| c.record.clone()).collect()
    }
}

pub struct Reconciler {
    max_backfill_cycles: Option<u32>,
}

impl Reconciler {
    pub fn new(max_backfill_cycles: Option<u32>) -> Self {
        Self {
            max_backfill_cycles,
        }
    }

    fn may_backfill(&self, previous: &MachineRecord) -> bool {
        self.max_backfill_cycles
            .is_none_or(|max| previous.backfill_age < max)
    }

    /// Reconcile one cycle's snapshots against the stored state.
    ///
    /// `current_view` is the current view as it was before this cycle,
    /// `latest_history` the newest history row per machine.
    pub fn reconcile(
        &self,
        snapshots: &[MachineSnapshot],
        current_view: &[MachineRecord],
        latest_history: &[MachineRecord],
        timestamp: DateTime<Utc>,
    ) -> Reconciliation {
        let current_by_id: HashMap<&str, &MachineRecord> = current_view
            .iter()
            .map(|r| (r.machine_id.as_str(), r))
            .collect();
        let history_by_id: HashMap<&str, &MachineRecord> = latest_history
            .iter()
            .map(|r| (r.machine_id.as_str(), r))
            .collect();

        let mut result = Reconciliation::default();

        for snapshot in snapshots {
            let Some(status) = snapshot.status_code.normalize() else {
                warn!(
                    "dropping {}: unusable status {}",
                    snapshot.machine_id, snapshot.status_code.0
                );
                result.dropped.push(DroppedReading {
                    machine_id: snapshot.machine_id.clone(),
                    raw_status: snapshot.status_code.0,
                });
                continue;
            };

            let mut record = MachineRecord::from_snapshot(snapshot, status, timestamp);
            let previous_current = current_by_id
                .get(snapshot.machine_id.as_str())
                .copied()
                .filter(|prev| self.may_backfill(prev));
            let mut backfilled = false;

            if let Some(prev) = previous_current {
                backfilled |= fill(&mut record.total_count, &prev.total_count);
                backfilled |= fill(&mut record.ng_count, &prev.ng_count);
            }

            match history_by_id.get(snapshot.machine_id.as_str()) {
                None => {
                    debug!("{} seen for the first time", record.machine_id);
                    result.changed.push(Change {
                        record: record.clone(),
                        fields: Vec::new(),
                        first_seen: true,
                    });
                }
                Some(previous) => {
                    let fields = diff(&record, previous);
                    if !fields.is_empty() {
                        debug!(
                            "{} changed: {}",
                            record.machine_id,
                            fields
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        result.changed.push(Change {
                            record: record.clone(),
                            fields,
                            first_seen: false,
                        });
                    }
                }
            }

            if let Some(prev) = previous_current {
                backfilled |= fill(&mut record.part_count, &prev.part_count);
                backfilled |= fill(&mut record.program_id, &prev.program_id);
                backfilled |= fill(&mut record.drawing_no, &prev.drawing_no);
                backfilled |= fill(&mut record.cycle_time, &prev.cycle_time);
            }

            if backfilled {
                record.backfill_age = current_by_id
                    .get(snapshot.machine_id.as_str())
                    .map_or(0, |prev| prev.backfill_age)
                    .saturating_add(1);
            }

            result
                .tools
                .extend(ToolRecord::from_snapshot(snapshot, timestamp));
            result.current.push(record);
        }

        result
    }
}

/// Fill an absent value from the previous one. Returns whether it did.
fn fill<T: Clone>(value: &mut Option<T>, previous: &Option<T>) -> bool {
    if value.is_none() && previous.is_some() {
        *value = previous.clone();
        true
    } else {
        false
    }
}
