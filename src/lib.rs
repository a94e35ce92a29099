pub mod config;
pub mod dashboards;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod render;
pub mod samples;
pub mod shard;

use crate::config::{HolodeckConfig, StoreSettings};
use crate::dashboards::DashboardStore;
use crate::db::{Database, ShardDatabase};
use crate::errors::{AppError, AppResult};
use crate::metrics::{ApiKeyGenerator, MetricStore};
use crate::models::{Sample, SamplePayload};
use crate::render::RendererRegistry;
use crate::samples::SampleStore;
use crate::shard::{SampleShard, ShardRouter};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// The canonical store, the sample shards and the stores wired over them.
#[derive(Debug, Clone)]
pub struct Holodeck {
    db: Arc<Database>,
    router: Arc<ShardRouter>,
    samples: SampleStore,
    metrics: MetricStore,
    dashboards: DashboardStore,
}

impl Holodeck {
    pub fn open(config: &HolodeckConfig, renderers: RendererRegistry) -> AppResult<Self> {
        config.validate()?;
        let canonical = Database::new(&config.canonical_path)?;
        let mut shards: Vec<Arc<dyn SampleShard>> = Vec::with_capacity(config.shard_count());
        for (shard_id, shard) in config.shards.iter().enumerate() {
            shards.push(Arc::new(ShardDatabase::new(shard_id, &shard.path)?));
        }
        Self::with_shards(canonical, shards, renderers, config.settings)
    }

    /// Wires pre-built shard handles; shard `i` of the vector serves partition `i`.
    pub fn with_shards(
        canonical: Database,
        shards: Vec<Arc<dyn SampleShard>>,
        renderers: RendererRegistry,
        settings: StoreSettings,
    ) -> AppResult<Self> {
        settings.validate()?;
        canonical.ensure_shard_count(shards.len())?;

        let db = Arc::new(canonical);
        let router = Arc::new(ShardRouter::new(shards)?);
        let samples = SampleStore::new(router.clone());
        let metrics = MetricStore::new(db.clone(), samples.clone(), Arc::new(renderers), settings);
        let dashboards = DashboardStore::new(db.clone(), metrics.clone());

        tracing::info!(shard_count = router.shard_count(), "holodeck store opened");
        Ok(Self {
            db,
            router,
            samples,
            metrics,
            dashboards,
        })
    }

    pub fn with_key_generator(mut self, key_generator: ApiKeyGenerator) -> Self {
        self.metrics = self.metrics.with_key_generator(key_generator);
        self.dashboards = DashboardStore::new(self.db.clone(), self.metrics.clone());
        self
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn metrics(&self) -> &MetricStore {
        &self.metrics
    }

    pub fn dashboards(&self) -> &DashboardStore {
        &self.dashboards
    }

    /// Stores a sample for the metric owning `api_key`. Any metric id in the
    /// payload is replaced by the key owner's id.
    pub fn ingest(&self, api_key: &str, payload: SamplePayload) -> AppResult<Sample> {
        let metric = self
            .metrics
            .get_by_api_key(api_key)?
            .ok_or_else(|| AppError::NotFound("no metric for api key".to_string()))?;
        let payload = SamplePayload {
            metric_id: metric.id,
            ..payload
        };
        self.samples.insert(&payload)
    }
}

pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "holodeck.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
