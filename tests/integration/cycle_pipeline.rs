//! End-to-end cycles against a scripted fleet and in-memory storage

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use fleet_recorder::{
    StatusCode,
    config::{StatusSource, parse_config},
    cycle::FleetCycle,
    notifier::AlertClass,
    protocol::LampBits,
    storage::{StorageBackend, memory::MemoryBackend},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::{
    Behaviour, FakeFleet, Machine, RecordingSink, addr, build_cycle, scenario_config,
};

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2026, 3, 2, hour, minute, second)
        .single()
        .unwrap()
}

fn scripted_fleet() -> FakeFleet {
    let fleet = FakeFleet::default();
    fleet.set(addr(168), Behaviour::Responds(Machine::running()));
    fleet.set(addr(169), Behaviour::TimesOut);
    // excluded, must never be contacted
    fleet.set(addr(170), Behaviour::Responds(Machine::running().with_lamps(0)));
    fleet
}

#[tokio::test]
async fn test_cycle_records_fleet_with_exclusion_and_timeout() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    let report = cycle.run_at(at(9, 0, 0)).await.unwrap();

    assert_eq!(report.polled, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.persist.history_rows, 2);
    assert!(!fleet.opened().contains(&addr(170)));

    let current = backend.load_current().await.unwrap();
    assert_eq!(current.len(), 2);

    let cnc01 = current.iter().find(|r| r.machine_id == "CNC01").unwrap();
    assert_eq!(cnc01.status, StatusCode::RUNNING);
    assert_eq!(cnc01.part_count, Some(120));
    assert_eq!(cnc01.total_count, Some(5000));
    assert_eq!(cnc01.ng_count, Some(3));
    assert_eq!(cnc01.program_id.as_deref(), Some("O0011"));
    assert_eq!(cnc01.drawing_no.as_deref(), Some("A-1234-01"));
    assert_eq!(cnc01.cycle_time.as_deref(), Some("00:01:30"));

    let cnc02 = current.iter().find(|r| r.machine_id == "CNC02").unwrap();
    assert_eq!(cnc02.status, StatusCode::UNKNOWN);
    assert_eq!(cnc02.address, addr(169));
    assert_eq!(cnc02.part_count, None);
    assert_eq!(cnc02.program_id, None);
    assert_eq!(cnc02.drawing_no, None);
    assert_eq!(cnc02.total_count, None);
    assert_eq!(cnc02.ng_count, None);

    let errlog = std::fs::read_to_string(dir.path().join("errlog")).unwrap();
    assert!(errlog.contains("192.168.1.169"));
    assert!(!errlog.contains("192.168.1.168"));
}

#[tokio::test]
async fn test_identical_cycle_adds_no_history() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    cycle.run_at(at(9, 0, 0)).await.unwrap();
    let report = cycle.run_at(at(9, 0, 10)).await.unwrap();

    assert_eq!(report.changed, 0);
    assert_eq!(report.persist.history_rows, 0);
    assert_eq!(report.persist.current_rows, 2);
    assert_eq!(report.persist.stale_rows, 2);
    assert_eq!(backend.query_history("CNC01", 10).await.unwrap().len(), 1);
    assert_eq!(backend.query_history("CNC02", 10).await.unwrap().len(), 1);

    // the current view is rewritten with the new timestamp
    let current = backend.load_current().await.unwrap();
    assert!(current.iter().all(|r| r.timestamp == at(9, 0, 10)));

    let stale = backend.load_forecast().await.unwrap();
    assert!(stale.iter().all(|r| r.status == StatusCode::STALE));
}

#[tokio::test]
async fn test_tool_history_only_records_renames() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    let first = cycle.run_at(at(9, 0, 0)).await.unwrap();
    assert_eq!(first.persist.tool_rows, 2);

    let second = cycle.run_at(at(9, 0, 10)).await.unwrap();
    assert_eq!(second.persist.tool_rows, 0);

    fleet.update(addr(168), |machine| {
        *machine = machine.clone().with_header(
            "%\nO0011(BRACKET)\n(DWG:A-1234-01)\n(T1 CENTER DRILL)\n(T3 EM8)\nG91 G28 Z0.\n",
        );
    });
    let third = cycle.run_at(at(9, 0, 20)).await.unwrap();
    assert_eq!(third.persist.tool_rows, 1);

    let names: Vec<String> = backend
        .query_tool_history("CNC01")
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.tool_number == "T3")
        .map(|t| t.tool_name)
        .collect();
    assert_eq!(names, vec!["EM6".to_string(), "EM8".to_string()]);
}

#[tokio::test]
async fn test_excluded_machine_never_alerts() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    fleet.update(addr(168), |machine| machine.lamps = 0);
    let sink = RecordingSink::default();
    let cycle = build_cycle(&config, &fleet, &sink, Arc::new(MemoryBackend::new()));

    let report = cycle.run_at(at(14, 0, 0)).await.unwrap();

    assert_eq!(report.notify.attempted, 1);
    assert!(sink.machines().contains("CNC01"));
    assert!(!sink.machines().contains("CNC03"));
    // unreachable machines report the sentinel, which never alerts
    assert!(!sink.machines().contains("CNC02"));
}

#[tokio::test]
async fn test_quiet_window_suppresses_alerts() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    fleet.update(addr(168), |machine| machine.lamps = LampBits::RED);
    let sink = RecordingSink::default();
    let cycle = build_cycle(&config, &fleet, &sink, Arc::new(MemoryBackend::new()));

    let during = cycle.run_at(at(12, 30, 0)).await.unwrap();
    assert_eq!(during.notify.attempted, 0);
    assert_eq!(sink.count(), 0);

    let after = cycle.run_at(at(13, 0, 1)).await.unwrap();
    assert_eq!(after.notify.attempted, 1);
    assert_eq!(
        sink.calls.lock().unwrap().as_slice(),
        &[("CNC01".to_string(), AlertClass::Alarm)]
    );
}

#[tokio::test]
async fn test_missing_part_count_is_history_but_backfilled_in_current() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    cycle.run_at(at(9, 0, 0)).await.unwrap();

    fleet.update(addr(168), |machine| {
        machine.counters.remove(&3901);
    });
    let report = cycle.run_at(at(9, 0, 10)).await.unwrap();
    assert_eq!(report.persist.history_rows, 1);

    let history = backend.query_history("CNC01", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].part_count, None);
    assert_eq!(history[1].part_count, Some(120));

    let current = backend.load_current().await.unwrap();
    let cnc01 = current.iter().find(|r| r.machine_id == "CNC01").unwrap();
    assert_eq!(cnc01.part_count, Some(120));
    assert_eq!(cnc01.backfill_age, 1);
}

#[tokio::test]
async fn test_run_state_hold_is_recorded_as_running() {
    let dir = TempDir::new().unwrap();
    let mut config = scenario_config(&dir.path().join("errlog"));
    config.fleet.status_source = StatusSource::RunState;
    let fleet = scripted_fleet();
    fleet.update(addr(168), |machine| machine.run_state = 2);
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    let report = cycle.run_at(at(14, 0, 0)).await.unwrap();

    assert_eq!(report.notify.attempted, 0);
    let current = backend.load_current().await.unwrap();
    let cnc01 = current.iter().find(|r| r.machine_id == "CNC01").unwrap();
    assert_eq!(cnc01.status, StatusCode::RUNNING);
}

#[tokio::test]
async fn test_garbled_status_drops_machine_and_is_logged() {
    let dir = TempDir::new().unwrap();
    let mut config = scenario_config(&dir.path().join("errlog"));
    config.fleet.status_source = StatusSource::RunState;
    let fleet = scripted_fleet();
    fleet.update(addr(168), |machine| machine.run_state = 77);
    let sink = RecordingSink::default();
    let backend = Arc::new(MemoryBackend::new());
    let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

    let report = cycle.run_at(at(9, 0, 0)).await.unwrap();

    assert_eq!(report.dropped_statuses, 1);
    let current = backend.load_current().await.unwrap();
    assert!(current.iter().all(|r| r.machine_id != "CNC01"));

    let errlog = std::fs::read_to_string(dir.path().join("errlog")).unwrap();
    assert!(errlog.contains("CNC01: unusable status 77"));
}

#[tokio::test]
async fn test_alerts_limited_to_enabled_machines() {
    let dir = TempDir::new().unwrap();
    let config = parse_config(&format!(
        r#"{{
            "fleet": {{ "first": "192.168.1.168", "last": "192.168.1.169" }},
            "storage": {{ "backend": "none" }},
            "notifier": {{ "enabled_machines": ["CNC02"], "quiet_window": null }},
            "error_log": {:?}
        }}"#,
        dir.path().join("errlog").display().to_string()
    ))
    .unwrap();
    let fleet = FakeFleet::default();
    fleet.set(addr(168), Behaviour::Responds(Machine::running().with_lamps(0)));
    fleet.set(
        addr(169),
        Behaviour::Responds(Machine::running().with_lamps(LampBits::RED)),
    );
    let sink = RecordingSink::default();
    let cycle = build_cycle(&config, &fleet, &sink, Arc::new(MemoryBackend::new()));

    cycle.run_at(at(12, 30, 0)).await.unwrap();

    assert_eq!(
        sink.calls.lock().unwrap().as_slice(),
        &[("CNC02".to_string(), AlertClass::Alarm)]
    );
}

#[tokio::test]
async fn test_cycle_from_config_checks_storage_and_runs() {
    let dir = TempDir::new().unwrap();
    let config = scenario_config(&dir.path().join("errlog"));
    let fleet = scripted_fleet();

    let cycle = FleetCycle::from_config(&config, Arc::new(fleet.clone()))
        .await
        .unwrap();
    let report = cycle.run_at(at(9, 0, 0)).await.unwrap();

    assert_eq!(report.polled, 2);
    assert_eq!(report.notify.skipped, 0);
    let stats = cycle.backend().get_stats().await.unwrap();
    assert!(stats.contains("2 machines"));
}
