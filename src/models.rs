use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ShardId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: i64,
    pub name: String,
    /// Opaque reference into the external user directory.
    pub owner_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// `None` until the metric has been saved to the canonical store.
    pub id: Option<i64>,
    pub name: String,
    pub dashboard_id: i64,
    pub widget_type: String,
    pub api_key: Option<String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, dashboard_id: i64, widget_type: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            dashboard_id,
            widget_type: widget_type.into(),
            api_key: None,
        }
    }
}

/// A stored sample. Samples are immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub id: i64,
    pub metric_id: i64,
    pub integer_value: i64,
    pub string_value: String,
    pub timestamp: DateTime<Utc>,
}

/// Untrusted ingest shape; every field is checked by `SampleStore::insert`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePayload {
    pub metric_id: Option<i64>,
    pub integer_value: Option<i64>,
    pub string_value: Option<String>,
    pub timestamp: Option<String>,
}

/// A payload that passed validation and has a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSample {
    pub metric_id: i64,
    pub integer_value: i64,
    pub string_value: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
#[must_use]
pub enum DeleteOutcome {
    Complete {
        metric_id: i64,
        samples_deleted: usize,
    },
    /// The metric row is gone but its samples are still on the shard.
    CascadeIncomplete {
        metric_id: i64,
        shard_id: ShardId,
        reason: String,
    },
}

impl DeleteOutcome {
    pub fn metric_id(&self) -> i64 {
        match self {
            Self::Complete { metric_id, .. } | Self::CascadeIncomplete { metric_id, .. } => *metric_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn into_result(self) -> crate::errors::AppResult<usize> {
        match self {
            Self::Complete { samples_deleted, .. } => Ok(samples_deleted),
            Self::CascadeIncomplete {
                metric_id,
                shard_id,
                reason,
            } => Err(crate::errors::AppError::CascadeIncomplete {
                metric_id,
                shard_id,
                reason,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCascade {
    pub metric_id: i64,
    pub shard_id: ShardId,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub reconciled: Vec<i64>,
    pub samples_deleted: usize,
    pub still_pending: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedOutput {
    pub metric_id: i64,
    pub widget_type: String,
    pub content: serde_json::Value,
}
