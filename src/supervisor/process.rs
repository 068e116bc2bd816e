//! Finding and killing cycle workers by command line

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

/// A running process whose command line matched the worker signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub age: Duration,
    pub command: String,
}

pub trait ProcessTable: Send {
    /// Processes whose command line contains `signature`. Never includes the
    /// calling process.
    fn find_workers(&mut self, signature: &str) -> Vec<WorkerProcess>;

    /// Returns `true` if the signal was delivered.
    fn kill(&mut self, pid: u32) -> bool;
}

pub struct SysinfoProcessTable {
    system: System,
    own_pid: u32,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            own_pid: std::process::id(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn find_workers(&mut self, signature: &str) -> Vec<WorkerProcess> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let mut workers: Vec<WorkerProcess> = self
            .system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != self.own_pid)
            .filter_map(|(pid, process)| {
                let command = process
                    .cmd()
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                command.contains(signature).then(|| WorkerProcess {
                    pid: pid.as_u32(),
                    age: Duration::from_secs(process.run_time()),
                    command,
                })
            })
            .collect();
        workers.sort_by_key(|w| w.pid);

        debug!("{} processes match '{signature}'", workers.len());
        workers
    }

    fn kill(&mut self, pid: u32) -> bool {
        if pid == self.own_pid {
            warn!("refusing to kill own process {pid}");
            return false;
        }
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process.kill(),
            None => false,
        }
    }
}
