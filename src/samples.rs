use crate::errors::{AppError, AppResult};
use crate::models::{Metric, NewSample, Sample, SamplePayload, ShardId};
use crate::shard::{SampleShard, ShardRouter};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

pub const MAX_STRING_VALUE_CHARS: usize = 64;

/// Sample CRUD. Every call resolves its shard through the router.
#[derive(Debug, Clone)]
pub struct SampleStore {
    router: Arc<ShardRouter>,
}

impl SampleStore {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn insert(&self, payload: &SamplePayload) -> AppResult<Sample> {
        let (shard_id, shard) = self.router.route(payload.metric_id)?;
        let sample = validate_sample(payload)?;
        let stored = shard.insert(&sample)?;
        tracing::debug!(
            metric_id = stored.metric_id,
            shard_id,
            sample_id = stored.id,
            "stored sample"
        );
        Ok(stored)
    }

    /// Lazy handle over the metric's samples; nothing is read until asked.
    pub fn query_by_metric(&self, metric: &Metric) -> AppResult<SampleSet> {
        let (shard_id, shard) = self.router.route(metric.id)?;
        Ok(SampleSet {
            // route() already rejected a missing id
            metric_id: metric.id.unwrap_or_default(),
            shard_id,
            shard,
        })
    }

    pub fn delete_by_metric(&self, metric: &Metric) -> AppResult<usize> {
        self.query_by_metric(metric)?.delete()
    }
}

/// The samples of one metric on its shard. Each read is a fresh snapshot.
#[derive(Clone)]
pub struct SampleSet {
    metric_id: i64,
    shard_id: ShardId,
    shard: Arc<dyn SampleShard>,
}

impl SampleSet {
    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn load(&self) -> AppResult<Vec<Sample>> {
        self.shard.select_by_metric(self.metric_id)
    }

    pub fn latest(&self, limit: u32) -> AppResult<Vec<Sample>> {
        self.shard.select_latest(self.metric_id, limit)
    }

    pub fn count(&self) -> AppResult<usize> {
        self.shard.count_by_metric(self.metric_id)
    }

    pub fn delete(&self) -> AppResult<usize> {
        let deleted = self.shard.delete_by_metric(self.metric_id)?;
        tracing::debug!(metric_id = self.metric_id, shard_id = self.shard_id, deleted, "deleted samples");
        Ok(deleted)
    }
}

impl fmt::Debug for SampleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSet")
            .field("metric_id", &self.metric_id)
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

/// Checks every field and reports all violations together.
pub fn validate_sample(payload: &SamplePayload) -> AppResult<NewSample> {
    let mut violations = Vec::new();

    let Some(metric_id) = payload.metric_id else {
        return Err(AppError::InvalidRoutingKey("sample has no metric id".to_string()));
    };

    if payload.integer_value.is_none() {
        violations.push("integer_value: required".to_string());
    }

    match payload.string_value.as_deref() {
        None => violations.push("string_value: required".to_string()),
        Some(value) if value.chars().count() > MAX_STRING_VALUE_CHARS => violations.push(format!(
            "string_value: at most {} characters, got {}",
            MAX_STRING_VALUE_CHARS,
            value.chars().count()
        )),
        Some(_) => {}
    }

    let timestamp = match payload.timestamp.as_deref() {
        None => {
            violations.push("timestamp: required".to_string());
            None
        }
        Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(error) => {
                violations.push(format!("timestamp: '{}' is not RFC 3339 ({})", raw, error));
                None
            }
        },
    };

    match (payload.integer_value, payload.string_value.as_ref(), timestamp) {
        (Some(integer_value), Some(string_value), Some(timestamp)) if violations.is_empty() => Ok(NewSample {
            metric_id,
            integer_value,
            string_value: string_value.clone(),
            timestamp,
        }),
        _ => Err(AppError::Validation(violations)),
    }
}
