//! Supervisor - keeps cycles running on one host
//!
//! ## Step
//!
//! ```text
//! uptime check ──(max uptime reached)──► restart
//!      │
//! health probe (every health_interval, log only)
//!      │
//! liveness check ──(no success for liveness_threshold)──► kill stuck workers
//!      │                                                   (once per detection)
//! launch cycle (time-boxed) ──► Success | Timeout | Failure
//!      │
//! failure ladder: >= cleanup_after  -> kill stuck workers, back off
//!                 >= restart_after  -> restart
//!      │
//! sleep (cycle_interval or backoff)
//! ```
//!
//! Every collaborator sits behind a trait so the state machine can be driven
//! with fakes and a paused clock.

pub mod health;
pub mod process;
pub mod restart;
pub mod runner;

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub use health::{HealthProbe, HealthSample, SysinfoHealthProbe};
pub use process::{ProcessTable, SysinfoProcessTable, WorkerProcess};
pub use restart::{ExecRestarter, Restarter};
pub use runner::{ChildProcessRunner, CycleRunner};

use crate::config::SupervisorConfig;

/// How one cycle execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    /// The time box expired and the cycle was killed
    Timeout,
    /// The cycle exited unsuccessfully or could not be launched
    Failure { code: Option<i32>, message: String },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Success => write!(f, "success"),
            CycleOutcome::Timeout => write!(f, "timeout"),
            CycleOutcome::Failure { message, .. } => write!(f, "failure ({message})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    MaxUptime,
    TooManyFailures,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::MaxUptime => write!(f, "maximum uptime reached"),
            RestartReason::TooManyFailures => write!(f, "too many consecutive failures"),
        }
    }
}

/// Supervisor timing and thresholds
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub cycle_interval: Duration,
    pub cycle_timeout: Duration,
    pub liveness_threshold: Duration,
    pub min_process_age: Duration,
    pub max_uptime: Duration,
    pub health_interval: Duration,
    pub memory_degraded_percent: f32,
    pub disk_degraded_percent: f32,
    pub cleanup_after_failures: u32,
    pub restart_after_failures: u32,
    pub backoff: Duration,
    pub restart_grace: Duration,
    pub process_signature: String,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            cycle_interval: Duration::from_secs(config.cycle_interval_secs),
            cycle_timeout: Duration::from_secs(config.cycle_timeout_secs),
            liveness_threshold: Duration::from_secs(config.liveness_threshold_secs),
            min_process_age: Duration::from_secs(config.min_process_age_secs),
            max_uptime: Duration::from_secs(config.max_uptime_secs),
            health_interval: Duration::from_secs(config.health_interval_secs),
            memory_degraded_percent: config.memory_degraded_percent,
            disk_degraded_percent: config.disk_degraded_percent,
            cleanup_after_failures: config.cleanup_after_failures,
            restart_after_failures: config.restart_after_failures,
            backoff: Duration::from_secs(config.backoff_secs),
            restart_grace: Duration::from_secs(config.restart_grace_secs),
            process_signature: config.process_signature.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorState {
    pub started: Instant,
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_health_check: Option<Instant>,
    /// Set when stuck workers were killed; cleared by the next success
    pub last_stuck_kill: Option<Instant>,
}

impl SupervisorState {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_success: None,
            consecutive_failures: 0,
            last_health_check: None,
            last_stuck_kill: None,
        }
    }
}

/// What one [`Supervisor::step`] did
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub outcome: Option<CycleOutcome>,
    pub health: Option<HealthSample>,
    pub degraded: bool,
    /// Workers killed by the liveness check
    pub stuck_killed: Vec<u32>,
    /// Workers killed by the failure ladder
    pub cleaned_up: Vec<u32>,
    pub restart: Option<RestartReason>,
    /// A replacement instance is running; this one should exit
    pub exit: bool,
    pub sleep: Duration,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    runner: Box<dyn CycleRunner>,
    processes: Box<dyn ProcessTable>,
    probe: Box<dyn HealthProbe>,
    restarter: Box<dyn Restarter>,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        runner: Box<dyn CycleRunner>,
        processes: Box<dyn ProcessTable>,
        probe: Box<dyn HealthProbe>,
        restarter: Box<dyn Restarter>,
    ) -> Self {
        Self {
            settings,
            runner,
            processes,
            probe,
            restarter,
            state: SupervisorState::new(Instant::now()),
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Run until a replacement has taken over.
    pub async fn run(&mut self) -> RestartReason {
        info!(
            "supervising cycles every {}s (time box {}s)",
            self.settings.cycle_interval.as_secs(),
            self.settings.cycle_timeout.as_secs()
        );
        loop {
            let report = self.step().await;
            if report.exit {
                let reason = report.restart.unwrap_or(RestartReason::MaxUptime);
                info!(
                    "exiting in {}s: {reason}",
                    self.settings.restart_grace.as_secs()
                );
                tokio::time::sleep(self.settings.restart_grace).await;
                return reason;
            }
            tokio::time::sleep(report.sleep).await;
        }
    }

    /// One pass through the state machine. Never fails; every problem ends
    /// up in the counters and the logs.
    #[instrument(skip(self), fields(failures = self.state.consecutive_failures))]
    pub async fn step(&mut self) -> StepReport {
        let mut report = StepReport {
            sleep: self.settings.cycle_interval,
            ..Default::default()
        };

        if self.state.started.elapsed() >= self.settings.max_uptime
            && self.restart(RestartReason::MaxUptime, &mut report).await
        {
            return report;
        }

        self.check_health(&mut report);
        self.check_liveness(&mut report);

        let outcome = self.runner.run_cycle(self.settings.cycle_timeout).await;
        let now = Instant::now();
        match &outcome {
            CycleOutcome::Success => {
                debug!("cycle succeeded");
                self.state.consecutive_failures = 0;
                self.state.last_success = Some(now);
                self.state.last_stuck_kill = None;
            }
            failed => {
                self.state.consecutive_failures += 1;
                warn!(
                    "cycle {failed}, {} consecutive failures",
                    self.state.consecutive_failures
                );
            }
        }
        report.outcome = Some(outcome);

        // The rungs stack: a restart that could not be spawned still cleans
        // up and backs off.
        let failures = self.state.consecutive_failures;
        if failures >= self.settings.restart_after_failures
            && self.restart(RestartReason::TooManyFailures, &mut report).await
        {
            return report;
        }
        if failures >= self.settings.cleanup_after_failures {
            warn!("{failures} consecutive failures, cleaning up and backing off");
            report.cleaned_up = self.kill_old_workers();
            report.sleep = self.settings.backoff;
        }

        report
    }

    fn check_health(&mut self, report: &mut StepReport) {
        let due = self
            .state
            .last_health_check
            .is_none_or(|at| at.elapsed() >= self.settings.health_interval);
        if !due {
            return;
        }

        let sample = self.probe.sample();
        self.state.last_health_check = Some(Instant::now());
        report.degraded = sample.memory_percent >= self.settings.memory_degraded_percent
            || sample.disk_percent >= self.settings.disk_degraded_percent;

        if report.degraded {
            warn!(
                "host degraded: memory {:.1}%, disk {:.1}%, cpu {:.1}%",
                sample.memory_percent, sample.disk_percent, sample.cpu_percent
            );
        } else {
            debug!(
                "host healthy: memory {:.1}%, disk {:.1}%, cpu {:.1}%",
                sample.memory_percent, sample.disk_percent, sample.cpu_percent
            );
        }
        report.health = Some(sample);
    }

    fn check_liveness(&mut self, report: &mut StepReport) {
        let threshold = self.settings.liveness_threshold;
        let reference = self.state.last_success.unwrap_or(self.state.started);
        if reference.elapsed() <= threshold {
            return;
        }

        let kill_due = self
            .state
            .last_stuck_kill
            .is_none_or(|at| at.elapsed() >= threshold);
        if !kill_due {
            return;
        }

        error!(
            "no successful cycle for {}s, killing stuck workers",
            reference.elapsed().as_secs()
        );
        report.stuck_killed = self.kill_old_workers();
        self.state.last_stuck_kill = Some(Instant::now());
    }

    /// Kill every worker older than the age guard. Returns the killed pids.
    fn kill_old_workers(&mut self) -> Vec<u32> {
        let workers = self.processes.find_workers(&self.settings.process_signature);
        let mut killed = Vec::new();
        for worker in workers {
            if worker.age < self.settings.min_process_age {
                debug!("sparing young worker {} ({}s old)", worker.pid, worker.age.as_secs());
                continue;
            }
            if self.processes.kill(worker.pid) {
                info!("killed worker {} ({}s old): {}", worker.pid, worker.age.as_secs(), worker.command);
                killed.push(worker.pid);
            } else {
                warn!("failed to kill worker {}", worker.pid);
            }
        }
        killed
    }

    /// Returns `true` if a replacement is running and this instance should
    /// exit.
    async fn restart(&mut self, reason: RestartReason, report: &mut StepReport) -> bool {
        warn!("restarting: {reason}");
        report.restart = Some(reason);
        match self.restarter.spawn_replacement().await {
            Ok(pid) => {
                info!("replacement supervisor running as {pid}");
                report.exit = true;
                true
            }
            Err(e) => {
                error!("failed to start replacement, continuing: {e}");
                false
            }
        }
    }
}
