mod shard;

pub use shard::ShardDatabase;

use crate::errors::{poisoned, AppError, AppResult};
use crate::models::{Dashboard, Metric, PendingCascade, ShardId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("canonical.sql");

/// Result of a metric write that may collide on the unique api key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedWrite {
    Written(i64),
    ApiKeyTaken,
}

/// The canonical (unsharded) store: dashboards, metrics and bookkeeping.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| poisoned("database"))
    }

    /// Records the shard count on first open and refuses any other count later.
    pub fn ensure_shard_count(&self, shard_count: usize) -> AppResult<()> {
        let conn = self.lock()?;
        let recorded = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'shard_count'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match recorded {
            Some(raw) => {
                let recorded: usize = serde_json::from_str(&raw)?;
                if recorded != shard_count {
                    return Err(AppError::Config(format!(
                        "store was created with {} shards but {} are configured; existing samples would become unreachable",
                        recorded, shard_count
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO settings (key, value_json, updated_at) VALUES ('shard_count', ?1, ?2)",
                    params![serde_json::to_string(&shard_count)?, format_time(Utc::now())],
                )?;
            }
        }
        Ok(())
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub fn insert_dashboard(&self, name: &str, owner_ref: Option<&str>) -> AppResult<Dashboard> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboards (name, owner_ref, created_at) VALUES (?1, ?2, ?3)",
            params![name, owner_ref, format_time(now)],
        )?;
        Ok(Dashboard {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            owner_ref: owner_ref.map(ToString::to_string),
            created_at: parse_time(&format_time(now))?,
        })
    }

    pub fn get_dashboard(&self, id: i64) -> AppResult<Option<Dashboard>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, owner_ref, created_at FROM dashboards WHERE id = ?1",
            [id],
            parse_dashboard_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_dashboards(&self) -> AppResult<Vec<Dashboard>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name, owner_ref, created_at FROM dashboards ORDER BY id ASC")?;
        let rows = stmt.query_map([], parse_dashboard_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn rename_dashboard(&self, id: i64, name: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("UPDATE dashboards SET name = ?1 WHERE id = ?2", params![name, id])?;
        Ok(changed > 0)
    }

    pub fn delete_dashboard(&self, id: i64) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM dashboards WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // ─── Metrics ────────────────────────────────────────────────────────────

    /// Inserts a metric row. `id` of `None` lets SQLite assign the next id.
    pub fn insert_metric(
        &self,
        id: Option<i64>,
        name: &str,
        dashboard_id: i64,
        widget_type: &str,
        api_key: &str,
    ) -> AppResult<KeyedWrite> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO metrics (id, name, dashboard_id, widget_type, api_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, name, dashboard_id, widget_type, api_key, format_time(Utc::now())],
        );
        match inserted {
            Ok(_) => Ok(KeyedWrite::Written(conn.last_insert_rowid())),
            Err(error) if is_api_key_conflict(&error) => Ok(KeyedWrite::ApiKeyTaken),
            Err(error) => Err(error.into()),
        }
    }

    /// Updates the mutable columns. `api_key` only fills a NULL column; a
    /// stored key is kept as is. Returns `None` if the row does not exist.
    pub fn update_metric(&self, metric_id: i64, metric: &Metric) -> AppResult<Option<KeyedWrite>> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE metrics SET name = ?1, dashboard_id = ?2, widget_type = ?3,
             api_key = COALESCE(api_key, ?4) WHERE id = ?5",
            params![metric.name, metric.dashboard_id, metric.widget_type, metric.api_key, metric_id],
        );
        match updated {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(KeyedWrite::Written(metric_id))),
            Err(error) if is_api_key_conflict(&error) => Ok(Some(KeyedWrite::ApiKeyTaken)),
            Err(error) => Err(error.into()),
        }
    }

    pub fn get_metric(&self, id: i64) -> AppResult<Option<Metric>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, dashboard_id, widget_type, api_key FROM metrics WHERE id = ?1",
            [id],
            parse_metric_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_metric_by_api_key(&self, api_key: &str) -> AppResult<Option<Metric>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, dashboard_id, widget_type, api_key FROM metrics WHERE api_key = ?1",
            [api_key],
            parse_metric_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_metrics_for_dashboard(&self, dashboard_id: i64) -> AppResult<Vec<Metric>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, dashboard_id, widget_type, api_key FROM metrics
             WHERE dashboard_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([dashboard_id], parse_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn delete_metric(&self, id: i64) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM metrics WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    // ─── Pending cascades ───────────────────────────────────────────────────

    pub fn record_pending_cascade(&self, metric_id: i64, shard_id: ShardId, error: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_cascades (metric_id, shard_id, error, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(metric_id) DO UPDATE SET shard_id = excluded.shard_id, error = excluded.error",
            params![metric_id, shard_id as i64, error, format_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_pending_cascades(&self) -> AppResult<Vec<PendingCascade>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT metric_id, shard_id, error, created_at FROM pending_cascades ORDER BY created_at ASC, metric_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingCascade {
                metric_id: row.get(0)?,
                shard_id: row.get::<_, i64>(1)? as ShardId,
                error: row.get(2)?,
                created_at: parse_time(&row.get::<_, String>(3)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn has_pending_cascade(&self, metric_id: i64) -> AppResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM pending_cascades WHERE metric_id = ?1",
            [metric_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn clear_pending_cascade(&self, metric_id: i64) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM pending_cascades WHERE metric_id = ?1", [metric_id])?;
        Ok(changed > 0)
    }
}

pub(crate) fn open_connection(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
    }
    Connection::open(path).map_err(AppError::from)
}

fn is_api_key_conflict(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(failure, message) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
                && message.as_deref().is_some_and(|text| text.contains("metrics.api_key"))
        }
        _ => false,
    }
}

fn parse_dashboard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dashboard> {
    Ok(Dashboard {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_ref: row.get(2)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        dashboard_id: row.get(2)?,
        widget_type: row.get(3)?,
        api_key: row.get(4)?,
    })
}

/// Fixed-width UTC form; lexical order of the text equals temporal order.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::{format_time, Database, KeyedWrite};
    use crate::errors::AppError;
    use crate::models::Metric;
    use chrono::{TimeZone, Utc};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("canonical.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn metric_insert_reports_api_key_conflict() {
        let (_dir, db) = open();
        let dashboard = db.insert_dashboard("ops", None).expect("dashboard");
        let key = "0123456789abcdef0123456789abcdef";

        let first = db.insert_metric(None, "a", dashboard.id, "counter", key).expect("insert a");
        assert!(matches!(first, KeyedWrite::Written(_)));
        let second = db.insert_metric(None, "b", dashboard.id, "counter", key).expect("insert b");
        assert_eq!(second, KeyedWrite::ApiKeyTaken);
    }

    #[test]
    fn metric_insert_honours_an_explicit_id() {
        let (_dir, db) = open();
        let dashboard = db.insert_dashboard("ops", None).expect("dashboard");
        let written = db
            .insert_metric(Some(42), "a", dashboard.id, "counter", "0123456789abcdef0123456789abcdef")
            .expect("insert");
        assert_eq!(written, KeyedWrite::Written(42));
        let next = db
            .insert_metric(None, "b", dashboard.id, "counter", "ffffffffffffffffffffffffffffffff")
            .expect("insert");
        assert_eq!(next, KeyedWrite::Written(43));
    }

    #[test]
    fn update_never_replaces_a_stored_api_key() {
        let (_dir, db) = open();
        let dashboard = db.insert_dashboard("ops", Some("user-7")).expect("dashboard");
        let key = "0123456789abcdef0123456789abcdef";
        let KeyedWrite::Written(id) = db.insert_metric(None, "a", dashboard.id, "counter", key).expect("insert") else {
            panic!("expected write");
        };

        let mut changed = Metric::new("renamed", dashboard.id, "gauge");
        changed.api_key = Some("ffffffffffffffffffffffffffffffff".to_string());
        db.update_metric(id, &changed).expect("update");

        let stored = db.get_metric(id).expect("get").expect("exists");
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.widget_type, "gauge");
        assert_eq!(stored.api_key.as_deref(), Some(key));
    }

    #[test]
    fn shard_count_is_pinned_on_first_open() {
        let (_dir, db) = open();
        db.ensure_shard_count(4).expect("record");
        db.ensure_shard_count(4).expect("same count");
        assert!(matches!(db.ensure_shard_count(8), Err(AppError::Config(_))));
    }

    #[test]
    fn pending_cascades_round_trip() {
        let (_dir, db) = open();
        db.record_pending_cascade(17, 1, "shard offline").expect("record");
        db.record_pending_cascade(17, 1, "still offline").expect("re-record");

        let pending = db.list_pending_cascades().expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metric_id, 17);
        assert_eq!(pending[0].error, "still offline");

        assert!(db.clear_pending_cascade(17).expect("clear"));
        assert!(db.list_pending_cascades().expect("list").is_empty());
    }

    #[test]
    fn formatted_times_sort_lexically() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let later = earlier + chrono::Duration::nanoseconds(1);
        assert!(format_time(earlier) < format_time(later));
        assert_eq!(format_time(earlier), "2024-01-02T03:04:05.000000000Z");
        assert_eq!(format_time(later), "2024-01-02T03:04:05.000000001Z");
    }
}
