//! Routing of metric data to sample shards.
//!
//! Every routing decision reduces to [`ShardMapper::shard_for_metric_id`]. The
//! metric-side and sample-side entry points only extract the metric id and
//! hand it over, so a metric and its samples can never resolve to different
//! shards.

use crate::errors::{AppError, AppResult};
use crate::models::{Metric, NewSample, Sample, SamplePayload, ShardId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMapper {
    shard_count: usize,
}

impl ShardMapper {
    pub fn new(shard_count: usize) -> AppResult<Self> {
        if shard_count == 0 {
            return Err(AppError::Config("shard count must be at least 1".to_string()));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn shard_for_metric_id(&self, metric_id: Option<i64>) -> AppResult<ShardId> {
        let Some(metric_id) = metric_id else {
            return Err(AppError::InvalidRoutingKey("metric id is not set".to_string()));
        };
        // rem_euclid keeps negative ids inside 0..shard_count.
        Ok(metric_id.rem_euclid(self.shard_count as i64) as ShardId)
    }

    pub fn shard_for_metric(&self, metric: &Metric) -> AppResult<ShardId> {
        self.shard_for_metric_id(metric.id)
    }

    pub fn shard_for_sample<S: RoutingKey + ?Sized>(&self, sample: &S) -> AppResult<ShardId> {
        self.shard_for_metric_id(sample.routing_key())
    }
}

/// Anything carrying the metric id its shard is derived from.
pub trait RoutingKey {
    fn routing_key(&self) -> Option<i64>;
}

impl RoutingKey for Sample {
    fn routing_key(&self) -> Option<i64> {
        Some(self.metric_id)
    }
}

impl RoutingKey for NewSample {
    fn routing_key(&self) -> Option<i64> {
        Some(self.metric_id)
    }
}

impl RoutingKey for SamplePayload {
    fn routing_key(&self) -> Option<i64> {
        self.metric_id
    }
}

/// Storage for the sample partition held by one shard.
pub trait SampleShard: Send + Sync {
    fn insert(&self, sample: &NewSample) -> AppResult<Sample>;
    /// All samples of `metric_id`, oldest first.
    fn select_by_metric(&self, metric_id: i64) -> AppResult<Vec<Sample>>;
    /// The newest `limit` samples of `metric_id`, oldest first.
    fn select_latest(&self, metric_id: i64, limit: u32) -> AppResult<Vec<Sample>>;
    fn count_by_metric(&self, metric_id: i64) -> AppResult<usize>;
    fn delete_by_metric(&self, metric_id: i64) -> AppResult<usize>;
}

/// The mapper together with the shard handles it routes to.
#[derive(Clone)]
pub struct ShardRouter {
    mapper: ShardMapper,
    shards: Vec<Arc<dyn SampleShard>>,
}

impl ShardRouter {
    pub fn new(shards: Vec<Arc<dyn SampleShard>>) -> AppResult<Self> {
        let mapper = ShardMapper::new(shards.len())?;
        Ok(Self { mapper, shards })
    }

    pub fn mapper(&self) -> ShardMapper {
        self.mapper
    }

    pub fn shard_count(&self) -> usize {
        self.mapper.shard_count()
    }

    pub fn route(&self, metric_id: Option<i64>) -> AppResult<(ShardId, Arc<dyn SampleShard>)> {
        let shard_id = self.mapper.shard_for_metric_id(metric_id)?;
        let shard = self
            .shards
            .get(shard_id)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("shard {} is not configured", shard_id)))?;
        Ok((shard_id, shard))
    }

    pub fn shard(&self, shard_id: ShardId) -> AppResult<Arc<dyn SampleShard>> {
        self.shards
            .get(shard_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("shard {}", shard_id)))
    }
}

impl fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRouter")
            .field("shard_count", &self.shard_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ShardMapper;
    use crate::errors::AppError;
    use crate::models::{Metric, SamplePayload};

    #[test]
    fn metric_and_sample_routes_agree() {
        for shard_count in [1usize, 4, 16] {
            let mapper = ShardMapper::new(shard_count).expect("mapper");
            for id in [0i64, 1, 3, 17, 255, 1 << 40, -5] {
                let mut metric = Metric::new("m", 1, "counter");
                metric.id = Some(id);
                let sample = SamplePayload {
                    metric_id: Some(id),
                    ..SamplePayload::default()
                };
                assert_eq!(
                    mapper.shard_for_metric(&metric).expect("metric shard"),
                    mapper.shard_for_sample(&sample).expect("sample shard")
                );
            }
        }
    }

    #[test]
    fn uses_modulo_of_metric_id() {
        let mapper = ShardMapper::new(4).expect("mapper");
        assert_eq!(mapper.shard_for_metric_id(Some(17)).expect("shard"), 1);
        assert_eq!(mapper.shard_for_metric_id(Some(-1)).expect("shard"), 3);
    }

    #[test]
    fn missing_id_is_an_invalid_routing_key() {
        let mapper = ShardMapper::new(4).expect("mapper");
        let unsaved = Metric::new("m", 1, "counter");
        assert!(matches!(mapper.shard_for_metric(&unsaved), Err(AppError::InvalidRoutingKey(_))));
        assert!(matches!(
            mapper.shard_for_sample(&SamplePayload::default()),
            Err(AppError::InvalidRoutingKey(_))
        ));
    }

    #[test]
    fn zero_shards_is_rejected() {
        assert!(matches!(ShardMapper::new(0), Err(AppError::Config(_))));
    }
}
