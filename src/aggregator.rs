//! Aggregator - fans a cycle out to one poll per configured address
//!
//! ## Message Flow
//!
//! ```text
//! CyclePlan ──spawn──► [poll task]* ──(gated by Semaphore)──► Poller
//!                           │                    │
//!                           │ outcome            │ failure message
//!                           ▼                    ▼
//!                    join barrier          bounded mpsc channel
//!                           │                    │
//!                           └────► ResultTable ◄─┘ drained after the join
//! ```
//!
//! Each task owns exactly one slot of the result table (its address offset),
//! so the table itself needs no locking. Excluded offsets are never spawned
//! and their slots stay empty.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, instrument};

use crate::{
    PollFailure, PollFailureKind, PollOutcome,
    config::FleetConfig,
    poller::Poller,
    util::{address_range, machine_id},
};

/// One address to poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    /// Position in the configured address range (0 = first address)
    pub offset: usize,
    pub machine_id: String,
    pub address: Ipv4Addr,
}

/// Which addresses a cycle polls
#[derive(Debug, Clone)]
pub struct CyclePlan {
    targets: Vec<PollTarget>,
    slots: usize,
}

impl CyclePlan {
    pub fn new(first: Ipv4Addr, last: Ipv4Addr, excluded: &[usize], id_prefix: &str) -> Self {
        let addresses = address_range(first, last);
        let slots = addresses.len();
        let targets = addresses
            .into_iter()
            .enumerate()
            .filter(|(offset, _)| !excluded.contains(offset))
            .map(|(offset, address)| PollTarget {
                offset,
                machine_id: machine_id(id_prefix, offset),
                address,
            })
            .collect();

        Self { targets, slots }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(config.first, config.last, &config.excluded, &config.id_prefix)
    }

    pub fn targets(&self) -> &[PollTarget] {
        &self.targets
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// Fixed-size table with one slot per address in the range
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    slots: Vec<Option<PollOutcome>>,
}

impl ResultTable {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            slots: vec![None; slots],
        }
    }

    /// Fill a slot. Returns `false` if the slot is out of range or taken.
    pub fn insert(&mut self, offset: usize, outcome: PollOutcome) -> bool {
        match self.slots.get_mut(offset) {
            Some(slot @ None) => {
                *slot = Some(outcome);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, offset: usize) -> Option<&PollOutcome> {
        self.slots.get(offset).and_then(Option::as_ref)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &PollOutcome> {
        self.slots.iter().flatten()
    }

    /// Number of filled slots
    pub fn len(&self) -> usize {
        self.outcomes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn failures(&self) -> usize {
        self.outcomes().filter(|o| o.is_failure()).count()
    }
}

/// Everything a cycle's fan-out produced
#[derive(Debug, Clone)]
pub struct CycleResults {
    pub table: ResultTable,
    /// Poll error messages, in the order they were reported
    pub errors: Vec<String>,
    /// Messages lost because the error channel was full
    pub dropped_errors: usize,
    pub duration: Duration,
}

pub struct Aggregator {
    poller: Poller,
    concurrency: usize,
    error_capacity: usize,
}

impl Aggregator {
    pub fn new(poller: Poller, concurrency: usize, error_capacity: usize) -> Self {
        Self {
            poller,
            concurrency: concurrency.max(1),
            error_capacity: error_capacity.max(1),
        }
    }

    pub fn from_config(poller: Poller, config: &FleetConfig) -> Self {
        Self::new(poller, config.concurrency, config.error_channel_capacity)
    }

    /// Poll every planned address and wait for all of them.
    #[instrument(skip_all, fields(targets = plan.targets().len()))]
    pub async fn run_cycle(&self, plan: &CyclePlan) -> CycleResults {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let (error_tx, mut error_rx) = mpsc::channel::<String>(self.error_capacity);
        let dropped = Arc::new(AtomicUsize::new(0));

        debug!(
            "polling {} of {} addresses ({} at a time)",
            plan.targets().len(),
            plan.slots(),
            self.concurrency
        );

        let mut handles = Vec::with_capacity(plan.targets().len());
        for target in plan.targets().iter().cloned() {
            let poller = self.poller.clone();
            let permits = permits.clone();
            let error_tx = error_tx.clone();
            let dropped = dropped.clone();
            let machine_id = target.machine_id.clone();
            let address = target.address;

            let handle = tokio::spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let outcome = poller.poll(&machine_id, address).await;
                if let PollOutcome::Failed(failure) = &outcome {
                    let message = format!("({}) {}: {}", address, failure.kind, failure.message);
                    if error_tx.try_send(message).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                outcome
            });
            handles.push((target, handle));
        }
        drop(error_tx);

        let mut table = ResultTable::with_slots(plan.slots());
        let mut join_errors = Vec::new();
        for (target, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("poll task for {} died: {e}", target.machine_id);
                    join_errors.push(format!("({}) task failed: {e}", target.address));
                    PollOutcome::Failed(PollFailure {
                        machine_id: target.machine_id.clone(),
                        address: target.address,
                        kind: PollFailureKind::UnexpectedError,
                        message: e.to_string(),
                        poll_duration_ms: 0,
                    })
                }
            };
            if !table.insert(target.offset, outcome) {
                error!("slot {} was already filled", target.offset);
            }
        }

        let mut errors = Vec::new();
        while let Ok(message) = error_rx.try_recv() {
            errors.push(message);
        }
        errors.extend(join_errors);

        let duration = started.elapsed();
        info!(
            polled = table.len(),
            failed = table.failures(),
            duration_ms = duration.as_millis() as u64,
            "fan-out complete"
        );

        CycleResults {
            table,
            errors,
            dropped_errors: dropped.load(Ordering::Relaxed),
            duration,
        }
    }
}
