//! Cycles persisted through SQLite survive a reopen

use std::sync::Arc;

use chrono::{Local, TimeZone};
use fleet_recorder::{
    StatusCode,
    config::StorageConfig,
    storage::{StorageBackend, open_backend, sqlite::SqliteBackend},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::{Behaviour, FakeFleet, Machine, RecordingSink, addr, build_cycle, scenario_config};

#[tokio::test]
async fn test_cycles_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("fleet.db");
    let config = scenario_config(&dir.path().join("errlog"));

    let fleet = FakeFleet::default();
    fleet.set(addr(168), Behaviour::Responds(Machine::running()));
    fleet.set(addr(169), Behaviour::TimesOut);
    let sink = RecordingSink::default();

    {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let cycle = build_cycle(&config, &fleet, &sink, backend.clone());

        let at = |second| {
            Local
                .with_ymd_and_hms(2026, 3, 2, 9, 0, second)
                .single()
                .unwrap()
        };
        cycle.run_at(at(0)).await.unwrap();

        fleet.update(addr(168), |machine| {
            machine.counters.insert(3901, 121);
        });
        let report = cycle.run_at(at(10)).await.unwrap();
        assert_eq!(report.persist.history_rows, 1);

        backend.close().await.unwrap();
    }

    let reopened = open_backend(
        &StorageConfig::Sqlite {
            path: db_path.clone(),
        },
        None,
    )
    .await
    .unwrap();

    let current = reopened.load_current().await.unwrap();
    assert_eq!(current.len(), 2);
    let cnc01 = current.iter().find(|r| r.machine_id == "CNC01").unwrap();
    assert_eq!(cnc01.part_count, Some(121));
    assert_eq!(cnc01.address, addr(168));

    let history = reopened.query_history("CNC01", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].part_count, Some(121));
    assert_eq!(history[1].part_count, Some(120));

    let cnc02 = reopened.query_history("CNC02", 10).await.unwrap();
    assert_eq!(cnc02.len(), 1);
    assert_eq!(cnc02[0].status, StatusCode::UNKNOWN);

    let stale = reopened.load_forecast().await.unwrap();
    assert_eq!(stale.len(), 2);
    assert!(stale.iter().all(|r| r.status == StatusCode::STALE));

    let tools = reopened.query_tool_history("CNC01").await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].tool_number, "T1");
    assert_eq!(tools[1].tool_name, "EM6");

    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_db_path_override_is_used() {
    let dir = TempDir::new().unwrap();
    let configured = dir.path().join("configured.db");
    let override_path = dir.path().join("override.db");

    let backend = open_backend(
        &StorageConfig::Sqlite { path: configured.clone() },
        Some(override_path.clone()),
    )
    .await
    .unwrap();
    backend.close().await.unwrap();

    assert!(override_path.exists());
    assert!(!configured.exists());
}
