//! Supervisor driving real child processes through the failure ladder

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use fleet_recorder::{
    config::SupervisorConfig,
    supervisor::{
        ChildProcessRunner, CycleOutcome, HealthProbe, HealthSample, ProcessTable, RestartReason,
        Restarter, Supervisor, SupervisorSettings, WorkerProcess,
    },
};

#[derive(Clone, Default)]
struct StaticTable {
    killed: Arc<Mutex<Vec<u32>>>,
}

impl ProcessTable for StaticTable {
    fn find_workers(&mut self, signature: &str) -> Vec<WorkerProcess> {
        vec![
            WorkerProcess {
                pid: 7001,
                age: Duration::from_secs(600),
                command: format!("/opt/fleet/{signature} -f fleet.json"),
            },
            WorkerProcess {
                pid: 7002,
                age: Duration::from_secs(1),
                command: format!("/opt/fleet/{signature} -f fleet.json"),
            },
        ]
    }

    fn kill(&mut self, pid: u32) -> bool {
        self.killed.lock().unwrap().push(pid);
        true
    }
}

struct CalmProbe;

impl HealthProbe for CalmProbe {
    fn sample(&mut self) -> HealthSample {
        HealthSample {
            memory_percent: 40.0,
            cpu_percent: 10.0,
            disk_percent: 50.0,
        }
    }
}

#[derive(Clone, Default)]
struct CountingRestarter {
    calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl Restarter for CountingRestarter {
    async fn spawn_replacement(&self) -> std::io::Result<u32> {
        *self.calls.lock().unwrap() += 1;
        Ok(31337)
    }
}

fn settings() -> SupervisorSettings {
    let mut settings = SupervisorSettings::from(&SupervisorConfig {
        cleanup_after_failures: 2,
        restart_after_failures: 3,
        min_process_age_secs: 60,
        liveness_threshold_secs: 3600,
        ..Default::default()
    });
    settings.cycle_interval = Duration::from_millis(10);
    settings.backoff = Duration::from_millis(20);
    settings.cycle_timeout = Duration::from_secs(5);
    settings.restart_grace = Duration::ZERO;
    settings
}

fn supervisor(
    script: &str,
    settings: SupervisorSettings,
    table: &StaticTable,
    restarter: &CountingRestarter,
) -> Supervisor {
    Supervisor::new(
        settings,
        Box::new(ChildProcessRunner::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
        )),
        Box::new(table.clone()),
        Box::new(CalmProbe),
        Box::new(restarter.clone()),
    )
}

#[tokio::test]
async fn test_failing_cycles_climb_the_ladder() {
    let table = StaticTable::default();
    let restarter = CountingRestarter::default();
    let mut supervisor = supervisor("exit 1", settings(), &table, &restarter);

    let first = supervisor.step().await;
    assert_matches!(first.outcome, Some(CycleOutcome::Failure { code: Some(1), .. }));
    assert!(first.cleaned_up.is_empty());
    assert_eq!(first.sleep, Duration::from_millis(10));

    let second = supervisor.step().await;
    assert_eq!(second.cleaned_up, vec![7001]);
    assert_eq!(second.sleep, Duration::from_millis(20));
    assert!(!second.exit);

    let third = supervisor.step().await;
    assert_eq!(third.restart, Some(RestartReason::TooManyFailures));
    assert!(third.exit);
    assert_eq!(*restarter.calls.lock().unwrap(), 1);

    // the young worker was spared every time
    assert!(!table.killed.lock().unwrap().contains(&7002));
}

#[tokio::test]
async fn test_success_resets_failures() {
    let table = StaticTable::default();
    let restarter = CountingRestarter::default();
    let mut failing = supervisor("exit 2", settings(), &table, &restarter);
    failing.step().await;
    assert_eq!(failing.state().consecutive_failures, 1);

    let mut healthy = supervisor("exit 0", settings(), &table, &restarter);
    let report = healthy.step().await;
    assert_eq!(report.outcome, Some(CycleOutcome::Success));
    assert_eq!(healthy.state().consecutive_failures, 0);
    assert!(healthy.state().last_success.is_some());
    assert!(report.health.is_some());
    assert!(!report.degraded);
}

#[tokio::test]
async fn test_hung_cycle_is_killed_and_counted() {
    let table = StaticTable::default();
    let restarter = CountingRestarter::default();
    let mut settings = settings();
    settings.cycle_timeout = Duration::from_millis(200);
    let mut supervisor = supervisor("sleep 10", settings, &table, &restarter);

    let report = supervisor.step().await;

    assert_eq!(report.outcome, Some(CycleOutcome::Timeout));
    assert_eq!(supervisor.state().consecutive_failures, 1);
}

#[tokio::test]
async fn test_run_returns_after_handing_over() {
    let table = StaticTable::default();
    let restarter = CountingRestarter::default();
    let mut supervisor = supervisor("exit 1", settings(), &table, &restarter);

    let reason = tokio::time::timeout(Duration::from_secs(30), supervisor.run())
        .await
        .unwrap();

    assert_eq!(reason, RestartReason::TooManyFailures);
    assert_eq!(*restarter.calls.lock().unwrap(), 1);
}
