use super::{format_time, open_connection, parse_time};
use crate::errors::{poisoned, AppError, AppResult};
use crate::models::{NewSample, Sample, ShardId};
use crate::shard::SampleShard;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("shard.sql");

const SAMPLE_COLUMNS: &str = "id, metric_id, integer_value, string_value, timestamp";

/// One SQLite file holding the samples of a single shard.
#[derive(Debug)]
pub struct ShardDatabase {
    shard_id: ShardId,
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl ShardDatabase {
    pub fn new(shard_id: ShardId, path: &Path) -> AppResult<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        tracing::debug!(shard_id, path = %path.display(), "opened sample shard");

        Ok(Self {
            shard_id,
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| poisoned("shard"))
    }

    fn collect(&self, sql: &str, args: impl rusqlite::Params) -> AppResult<Vec<Sample>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, parse_sample_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl SampleShard for ShardDatabase {
    fn insert(&self, sample: &NewSample) -> AppResult<Sample> {
        let timestamp = format_time(sample.timestamp);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO samples (metric_id, integer_value, string_value, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![sample.metric_id, sample.integer_value, sample.string_value, timestamp],
        )?;
        Ok(Sample {
            id: conn.last_insert_rowid(),
            metric_id: sample.metric_id,
            integer_value: sample.integer_value,
            string_value: sample.string_value.clone(),
            timestamp: parse_time(&timestamp)?,
        })
    }

    fn select_by_metric(&self, metric_id: i64) -> AppResult<Vec<Sample>> {
        self.collect(
            &format!(
                "SELECT {} FROM samples WHERE metric_id = ?1 ORDER BY timestamp ASC, id ASC",
                SAMPLE_COLUMNS
            ),
            [metric_id],
        )
    }

    fn select_latest(&self, metric_id: i64, limit: u32) -> AppResult<Vec<Sample>> {
        self.collect(
            &format!(
                "SELECT {cols} FROM (
                   SELECT {cols} FROM samples WHERE metric_id = ?1
                   ORDER BY timestamp DESC, id DESC LIMIT ?2
                 ) ORDER BY timestamp ASC, id ASC",
                cols = SAMPLE_COLUMNS
            ),
            params![metric_id, limit],
        )
    }

    fn count_by_metric(&self, metric_id: i64) -> AppResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM samples WHERE metric_id = ?1", [metric_id], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn delete_by_metric(&self, metric_id: i64) -> AppResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM samples WHERE metric_id = ?1", [metric_id])?;
        Ok(deleted)
    }
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        id: row.get(0)?,
        metric_id: row.get(1)?,
        integer_value: row.get(2)?,
        string_value: row.get(3)?,
        timestamp: parse_time(&row.get::<_, String>(4)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::ShardDatabase;
    use crate::models::NewSample;
    use crate::shard::SampleShard;
    use chrono::{Duration, TimeZone, Utc};

    fn sample(metric_id: i64, value: i64, offset_secs: i64) -> NewSample {
        NewSample {
            metric_id,
            integer_value: value,
            string_value: format!("v{}", value),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn selects_in_timestamp_order_regardless_of_insert_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = ShardDatabase::new(0, &dir.path().join("shard_0.db")).expect("shard");
        shard.insert(&sample(4, 3, 30)).expect("insert");
        shard.insert(&sample(4, 1, 10)).expect("insert");
        shard.insert(&sample(4, 2, 20)).expect("insert");
        shard.insert(&sample(8, 9, 0)).expect("other metric");

        let values: Vec<i64> = shard
            .select_by_metric(4)
            .expect("select")
            .iter()
            .map(|s| s.integer_value)
            .collect();
        assert_eq!(values, vec![1, 2, 3]);

        let latest: Vec<i64> = shard
            .select_latest(4, 2)
            .expect("latest")
            .iter()
            .map(|s| s.integer_value)
            .collect();
        assert_eq!(latest, vec![2, 3]);
    }

    #[test]
    fn sub_microsecond_timestamps_keep_their_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = ShardDatabase::new(0, &dir.path().join("shard_0.db")).expect("shard");
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = NewSample {
            timestamp: base + Duration::nanoseconds(900),
            ..sample(6, 2, 0)
        };
        let earlier = NewSample {
            timestamp: base + Duration::nanoseconds(100),
            ..sample(6, 1, 0)
        };
        shard.insert(&later).expect("insert later");
        shard.insert(&earlier).expect("insert earlier");

        let stored = shard.select_by_metric(6).expect("select");
        let values: Vec<i64> = stored.iter().map(|s| s.integer_value).collect();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(stored[0].timestamp, earlier.timestamp);
        assert_eq!(stored[1].timestamp, later.timestamp);
    }

    #[test]
    fn delete_only_touches_one_metric() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = ShardDatabase::new(1, &dir.path().join("shard_1.db")).expect("shard");
        shard.insert(&sample(5, 1, 0)).expect("insert");
        shard.insert(&sample(5, 2, 1)).expect("insert");
        shard.insert(&sample(9, 3, 2)).expect("insert");

        assert_eq!(shard.delete_by_metric(5).expect("delete"), 2);
        assert_eq!(shard.count_by_metric(5).expect("count"), 0);
        assert_eq!(shard.count_by_metric(9).expect("count"), 1);
    }

    #[test]
    fn rejects_oversized_string_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = ShardDatabase::new(0, &dir.path().join("shard_0.db")).expect("shard");
        let mut oversized = sample(1, 1, 0);
        oversized.string_value = "x".repeat(65);
        assert!(shard.insert(&oversized).is_err());
    }
}
