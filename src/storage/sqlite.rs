//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (dashboards, the stale projection's consumers) are
//!   not blocked while a cycle writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds. "Latest" lookups break ties on
//! the autoincrement id, so two rows written within the same millisecond still
//! have a well-defined order.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{MachineRecord, ToolRecord};
use crate::StatusCode;

const RECORD_COLUMNS: &str = "machine_id, address, status, part_count, program_id, drawing_no, \
     total_count, ng_count, cycle_time, timestamp, backfill_age";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database and run migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                path: db_path_str.clone(),
                reason: e.to_string(),
            })?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::CorruptRow {
                column: "timestamp",
                value: millis.to_string(),
            })
    }

    fn record_from_row(row: &SqliteRow) -> StorageResult<MachineRecord> {
        let address: String = row.try_get("address")?;
        let address = address
            .parse()
            .map_err(|_| StorageError::CorruptRow {
                column: "address",
                value: address.clone(),
            })?;
        let backfill_age: i64 = row.try_get("backfill_age")?;

        Ok(MachineRecord {
            machine_id: row.try_get("machine_id")?,
            address,
            status: StatusCode(row.try_get("status")?),
            part_count: row.try_get("part_count")?,
            program_id: row.try_get("program_id")?,
            drawing_no: row.try_get("drawing_no")?,
            total_count: row.try_get("total_count")?,
            ng_count: row.try_get("ng_count")?,
            cycle_time: row.try_get("cycle_time")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?)?,
            backfill_age: backfill_age.max(0) as u32,
        })
    }

    fn tool_from_row(row: &SqliteRow) -> StorageResult<ToolRecord> {
        Ok(ToolRecord {
            machine_id: row.try_get("machine_id")?,
            tool_number: row.try_get("tool_number")?,
            tool_name: row.try_get("tool_name")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?)?,
        })
    }

    async fn insert_records(
        conn: &mut SqliteConnection,
        table: &'static str,
        rows: &[MachineRecord],
    ) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO {table} ({RECORD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for row in rows {
            sqlx::query(&sql)
                .bind(&row.machine_id)
                .bind(row.address.to_string())
                .bind(row.status.0)
                .bind(row.part_count)
                .bind(&row.program_id)
                .bind(&row.drawing_no)
                .bind(row.total_count)
                .bind(row.ng_count)
                .bind(&row.cycle_time)
                .bind(Self::timestamp_to_millis(&row.timestamp))
                .bind(row.backfill_age as i64)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Delete-then-insert inside one transaction.
    async fn replace_table(&self, table: &'static str, rows: Vec<MachineRecord>) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
        Self::insert_records(&mut tx, table, &rows).await?;
        tx.commit().await?;
        debug!("replaced {table} with {} rows", rows.len());
        Ok(())
    }

    async fn load_table(&self, table: &'static str) -> StorageResult<Vec<MachineRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {table} ORDER BY machine_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn count(&self, table: &'static str) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn load_current(&self) -> StorageResult<Vec<MachineRecord>> {
        self.load_table("current_state").await
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn replace_current(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        self.replace_table("current_state", rows).await
    }

    async fn latest_history(&self) -> StorageResult<Vec<MachineRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM history
            WHERE id IN (SELECT MAX(id) FROM history GROUP BY machine_id)
            ORDER BY machine_id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn append_history(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        Self::insert_records(&mut tx, "history", &rows).await?;
        tx.commit().await?;
        debug!("appended {} history rows", rows.len());
        Ok(())
    }

    async fn query_history(
        &self,
        machine_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<MachineRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM history WHERE machine_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(machine_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn latest_tools(&self) -> StorageResult<Vec<ToolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT machine_id, tool_number, tool_name, timestamp FROM tool_history
            WHERE id IN (SELECT MAX(id) FROM tool_history GROUP BY machine_id, tool_number)
            ORDER BY machine_id ASC, tool_number ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::tool_from_row).collect()
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn append_tool_history(&self, rows: Vec<ToolRecord>) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            sqlx::query(
                "INSERT INTO tool_history (machine_id, tool_number, tool_name, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&row.machine_id)
            .bind(&row.tool_number)
            .bind(&row.tool_name)
            .bind(Self::timestamp_to_millis(&row.timestamp))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_tool_history(&self, machine_id: &str) -> StorageResult<Vec<ToolRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT machine_id, tool_number, tool_name, timestamp FROM tool_history
            WHERE machine_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::tool_from_row).collect()
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn replace_forecast(&self, rows: Vec<MachineRecord>) -> StorageResult<()> {
        self.replace_table("forecast", rows).await
    }

    async fn load_forecast(&self) -> StorageResult<Vec<MachineRecord>> {
        self.load_table("forecast").await
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let current = self.count("current_state").await?;
        let history = self.count("history").await?;
        let tools = self.count("tool_history").await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(format!(
            "SQLite: {} machines, {} history rows, {} tool rows, {:.2} MB on disk",
            current,
            history,
            tools,
            file_size as f64 / 1_000_000.0
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
