use crate::config::StoreSettings;
use crate::db::{Database, KeyedWrite};
use crate::errors::{AppError, AppResult};
use crate::models::{DeleteOutcome, Metric, PendingCascade, ReconcileReport, RenderedOutput};
use crate::render::{RenderContext, RendererRegistry};
use crate::samples::SampleStore;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_METRIC_NAME_CHARS: usize = 255;
pub const MAX_WIDGET_TYPE_CHARS: usize = 64;

static API_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("valid regex"));

/// Source of fresh api keys.
pub type ApiKeyGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// 128 random bits as 32 lowercase hex characters.
pub fn generate_api_key() -> String {
    let bytes: [u8; 16] = rand::random();
    Uuid::from_bytes(bytes).simple().to_string()
}

pub fn is_well_formed_api_key(candidate: &str) -> bool {
    API_KEY_PATTERN.is_match(candidate)
}

/// Metric lifecycle against the canonical store, including the sample cascade.
#[derive(Clone)]
pub struct MetricStore {
    db: Arc<Database>,
    samples: SampleStore,
    renderers: Arc<RendererRegistry>,
    settings: StoreSettings,
    key_generator: ApiKeyGenerator,
}

impl MetricStore {
    pub fn new(
        db: Arc<Database>,
        samples: SampleStore,
        renderers: Arc<RendererRegistry>,
        settings: StoreSettings,
    ) -> Self {
        Self {
            db,
            samples,
            renderers,
            settings,
            key_generator: Arc::new(generate_api_key),
        }
    }

    pub fn with_key_generator(mut self, key_generator: ApiKeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn create(&self, name: &str, dashboard_id: i64, widget_type: &str) -> AppResult<Metric> {
        self.save(Metric::new(name, dashboard_id, widget_type))
    }

    /// Upsert: inserts when the metric has no id or its id has no row,
    /// otherwise updates. The api key is generated on the first save and
    /// never replaced afterwards.
    pub fn save(&self, metric: Metric) -> AppResult<Metric> {
        self.validate(&metric)?;

        let saved_id = match metric.id {
            None => self.insert_with_key(None, &metric)?,
            Some(id) => self.update_with_key(id, &metric)?,
        };

        self.db
            .get_metric(saved_id)?
            .ok_or_else(|| AppError::NotFound(format!("metric {}", saved_id)))
    }

    pub fn get(&self, id: i64) -> AppResult<Option<Metric>> {
        self.db.get_metric(id)
    }

    pub fn get_by_api_key(&self, api_key: &str) -> AppResult<Option<Metric>> {
        if !is_well_formed_api_key(api_key) {
            return Ok(None);
        }
        self.db.get_metric_by_api_key(api_key)
    }

    pub fn list_for_dashboard(&self, dashboard_id: i64) -> AppResult<Vec<Metric>> {
        self.db.list_metrics_for_dashboard(dashboard_id)
    }

    /// Deletes the metric row, then the metric's samples on its shard. The two
    /// steps are not atomic; a failed second step is reported as
    /// `CascadeIncomplete` and remembered for `reconcile_pending_cascades`.
    pub fn delete(&self, metric: &Metric) -> AppResult<DeleteOutcome> {
        let samples = self.samples.query_by_metric(metric)?;
        let metric_id = samples.metric_id();

        if !self.db.delete_metric(metric_id)? {
            return Err(AppError::NotFound(format!("metric {}", metric_id)));
        }
        tracing::info!(metric_id, "deleted metric");

        match samples.delete() {
            Ok(samples_deleted) => Ok(DeleteOutcome::Complete {
                metric_id,
                samples_deleted,
            }),
            Err(error) => {
                let shard_id = samples.shard_id();
                let reason = error.to_string();
                tracing::error!(
                    metric_id,
                    shard_id,
                    error = %reason,
                    "sample cascade failed; samples orphaned on shard"
                );
                if let Err(record_error) = self.db.record_pending_cascade(metric_id, shard_id, &reason) {
                    tracing::error!(metric_id, error = %record_error, "failed to record pending cascade");
                }
                Ok(DeleteOutcome::CascadeIncomplete {
                    metric_id,
                    shard_id,
                    reason,
                })
            }
        }
    }

    pub fn pending_cascades(&self) -> AppResult<Vec<PendingCascade>> {
        self.db.list_pending_cascades()
    }

    /// Retries the sample deletes of earlier incomplete cascades. Entries
    /// whose shard still fails stay pending.
    pub fn reconcile_pending_cascades(&self) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for pending in self.db.list_pending_cascades()? {
            let orphan = Metric {
                id: Some(pending.metric_id),
                ..Metric::new(String::new(), 0, String::new())
            };
            match self.samples.delete_by_metric(&orphan) {
                Ok(deleted) => {
                    self.db.clear_pending_cascade(pending.metric_id)?;
                    report.samples_deleted += deleted;
                    report.reconciled.push(pending.metric_id);
                    tracing::info!(metric_id = pending.metric_id, deleted, "reconciled pending cascade");
                }
                Err(error) => {
                    tracing::warn!(metric_id = pending.metric_id, error = %error, "pending cascade still failing");
                    self.db
                        .record_pending_cascade(pending.metric_id, pending.shard_id, &error.to_string())?;
                    report.still_pending.push(pending.metric_id);
                }
            }
        }
        Ok(report)
    }

    pub fn render(&self, metric: &Metric) -> AppResult<RenderedOutput> {
        let samples = self.samples.query_by_metric(metric)?;
        let context = RenderContext {
            metric: metric.clone(),
            samples,
            sample_window: self.settings.sample_window,
        };
        self.renderers.render(&context)
    }

    fn validate(&self, metric: &Metric) -> AppResult<()> {
        if !self.renderers.contains(&metric.widget_type) {
            return Err(AppError::UnknownWidgetType(metric.widget_type.clone()));
        }

        let mut violations = Vec::new();
        let name_chars = metric.name.trim().chars().count();
        if name_chars == 0 {
            violations.push("name: required".to_string());
        } else if metric.name.chars().count() > MAX_METRIC_NAME_CHARS {
            violations.push(format!("name: at most {} characters", MAX_METRIC_NAME_CHARS));
        }
        if let Some(api_key) = metric.api_key.as_deref() {
            if !is_well_formed_api_key(api_key) {
                violations.push("api_key: must be 32 lowercase hex characters".to_string());
            }
        }
        if !violations.is_empty() {
            return Err(AppError::Validation(violations));
        }

        if self.db.get_dashboard(metric.dashboard_id)?.is_none() {
            return Err(AppError::NotFound(format!("dashboard {}", metric.dashboard_id)));
        }
        Ok(())
    }

    /// Inserts a new row, at `id` when given. An id that still has samples
    /// waiting in `pending_cascades` is refused so orphans are never adopted.
    fn insert_with_key(&self, id: Option<i64>, metric: &Metric) -> AppResult<i64> {
        if let Some(id) = id {
            if self.db.has_pending_cascade(id)? {
                return Err(AppError::CascadeIncomplete {
                    metric_id: id,
                    shard_id: self.samples.router().mapper().shard_for_metric_id(Some(id))?,
                    reason: "orphaned samples must be reconciled before the id is reused".to_string(),
                });
            }
        }

        // A caller-supplied key gets exactly one attempt.
        if let Some(api_key) = metric.api_key.as_deref() {
            return match self
                .db
                .insert_metric(id, &metric.name, metric.dashboard_id, &metric.widget_type, api_key)?
            {
                KeyedWrite::Written(id) => {
                    tracing::info!(metric_id = id, dashboard_id = metric.dashboard_id, "created metric");
                    Ok(id)
                }
                KeyedWrite::ApiKeyTaken => Err(AppError::DuplicateApiKey("supplied api key is in use".to_string())),
            };
        }

        for attempt in 1..=self.settings.api_key_max_attempts {
            let api_key = (self.key_generator)();
            match self
                .db
                .insert_metric(id, &metric.name, metric.dashboard_id, &metric.widget_type, &api_key)?
            {
                KeyedWrite::Written(id) => {
                    tracing::info!(metric_id = id, dashboard_id = metric.dashboard_id, "created metric");
                    return Ok(id);
                }
                KeyedWrite::ApiKeyTaken => {
                    tracing::warn!(attempt, "generated api key collided; regenerating");
                }
            }
        }
        Err(self.keys_exhausted())
    }

    fn update_with_key(&self, id: i64, metric: &Metric) -> AppResult<i64> {
        let Some(stored) = self.db.get_metric(id)? else {
            return self.insert_with_key(Some(id), metric);
        };

        if let (Some(current), Some(requested)) = (stored.api_key.as_deref(), metric.api_key.as_deref()) {
            if current != requested {
                tracing::warn!(metric_id = id, "ignoring attempt to replace an existing api key");
            }
        }

        if stored.api_key.is_some() || metric.api_key.is_some() {
            return match self.db.update_metric(id, metric)? {
                Some(KeyedWrite::Written(id)) => Ok(id),
                Some(KeyedWrite::ApiKeyTaken) => {
                    Err(AppError::DuplicateApiKey("supplied api key is in use".to_string()))
                }
                None => self.insert_with_key(Some(id), metric),
            };
        }

        // Stored row has no key yet: fill it now, retrying on collision.
        for attempt in 1..=self.settings.api_key_max_attempts {
            let keyed = Metric {
                api_key: Some((self.key_generator)()),
                ..metric.clone()
            };
            match self.db.update_metric(id, &keyed)? {
                Some(KeyedWrite::Written(id)) => return Ok(id),
                Some(KeyedWrite::ApiKeyTaken) => {
                    tracing::warn!(metric_id = id, attempt, "generated api key collided; regenerating");
                }
                None => return self.insert_with_key(Some(id), metric),
            }
        }
        Err(self.keys_exhausted())
    }

    fn keys_exhausted(&self) -> AppError {
        tracing::error!(
            attempts = self.settings.api_key_max_attempts,
            "api key generation exhausted its retries"
        );
        AppError::DuplicateApiKey(format!(
            "no unique api key after {} attempts",
            self.settings.api_key_max_attempts
        ))
    }
}

impl std::fmt::Debug for MetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStore")
            .field("db", &self.db.path())
            .field("settings", &self.settings)
            .finish()
    }
}
