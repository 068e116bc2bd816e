//! Host pressure sampling

use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HealthSample {
    pub memory_percent: f32,
    pub cpu_percent: f32,
    /// Fullest disk
    pub disk_percent: f32,
}

pub trait HealthProbe: Send {
    fn sample(&mut self) -> HealthSample;
}

pub struct SysinfoHealthProbe {
    system: System,
    disks: Disks,
}

impl SysinfoHealthProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

impl HealthProbe for SysinfoHealthProbe {
    fn sample(&mut self) -> HealthSample {
        self.system.refresh_memory();
        // first call after construction reports 0; later samples are deltas
        self.system.refresh_cpu_usage();
        self.disks.refresh(true);

        let disk_percent = self
            .disks
            .list()
            .iter()
            .map(|disk| {
                percent(
                    disk.total_space().saturating_sub(disk.available_space()),
                    disk.total_space(),
                )
            })
            .fold(0.0_f32, f32::max);

        HealthSample {
            memory_percent: percent(self.system.used_memory(), self.system.total_memory()),
            cpu_percent: self.system.global_cpu_usage(),
            disk_percent,
        }
    }
}
