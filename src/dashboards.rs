use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::metrics::MetricStore;
use crate::models::{Dashboard, DeleteOutcome, Metric, RenderedOutput};
use std::sync::Arc;

const MAX_DASHBOARD_NAME_CHARS: usize = 255;

#[derive(Debug, Clone)]
pub struct DashboardStore {
    db: Arc<Database>,
    metrics: MetricStore,
}

impl DashboardStore {
    pub fn new(db: Arc<Database>, metrics: MetricStore) -> Self {
        Self { db, metrics }
    }

    pub fn create(&self, name: &str, owner_ref: Option<&str>) -> AppResult<Dashboard> {
        validate_name(name)?;
        let dashboard = self.db.insert_dashboard(name, owner_ref)?;
        tracing::info!(dashboard_id = dashboard.id, "created dashboard");
        Ok(dashboard)
    }

    pub fn get(&self, id: i64) -> AppResult<Option<Dashboard>> {
        self.db.get_dashboard(id)
    }

    pub fn list(&self) -> AppResult<Vec<Dashboard>> {
        self.db.list_dashboards()
    }

    pub fn rename(&self, id: i64, name: &str) -> AppResult<Dashboard> {
        validate_name(name)?;
        if !self.db.rename_dashboard(id, name)? {
            return Err(AppError::NotFound(format!("dashboard {}", id)));
        }
        self.require(id)
    }

    /// Metrics of the dashboard in creation order.
    pub fn list_metrics(&self, dashboard_id: i64) -> AppResult<Vec<Metric>> {
        self.require(dashboard_id)?;
        self.metrics.list_for_dashboard(dashboard_id)
    }

    /// Deletes every metric of the dashboard (each with its own sample
    /// cascade) and then the dashboard itself.
    pub fn delete(&self, dashboard_id: i64) -> AppResult<Vec<DeleteOutcome>> {
        self.require(dashboard_id)?;
        let outcomes = self.delete_metrics(&self.metrics.list_for_dashboard(dashboard_id)?)?;
        self.db.delete_dashboard(dashboard_id)?;

        let incomplete = outcomes.iter().filter(|outcome| !outcome.is_complete()).count();
        tracing::info!(dashboard_id, metrics = outcomes.len(), incomplete, "deleted dashboard");
        Ok(outcomes)
    }

    pub fn render_dashboard(&self, dashboard_id: i64) -> AppResult<Vec<RenderedOutput>> {
        self.list_metrics(dashboard_id)?
            .iter()
            .map(|metric| self.metrics.render(metric))
            .collect()
    }

    /// A metric deleted concurrently after the listing is skipped.
    fn delete_metrics(&self, metrics: &[Metric]) -> AppResult<Vec<DeleteOutcome>> {
        let mut outcomes = Vec::with_capacity(metrics.len());
        for metric in metrics {
            match self.metrics.delete(metric) {
                Ok(outcome) => outcomes.push(outcome),
                Err(AppError::NotFound(_)) => {
                    tracing::debug!(metric_id = ?metric.id, "metric already gone; skipping");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(outcomes)
    }

    fn require(&self, id: i64) -> AppResult<Dashboard> {
        self.db
            .get_dashboard(id)?
            .ok_or_else(|| AppError::NotFound(format!("dashboard {}", id)))
    }
}

fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::Validation(vec!["name: required".to_string()]));
    }
    if name.chars().count() > MAX_DASHBOARD_NAME_CHARS {
        return Err(AppError::Validation(vec![format!(
            "name: at most {} characters",
            MAX_DASHBOARD_NAME_CHARS
        )]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::HolodeckConfig;
    use crate::errors::AppResult;
    use crate::render::{RenderContext, RendererRegistry, WidgetRenderer};
    use crate::Holodeck;
    use std::sync::Arc;

    struct Blank;

    impl WidgetRenderer for Blank {
        fn render(&self, _context: &RenderContext) -> AppResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn metrics_removed_after_listing_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = HolodeckConfig::new(
            dir.path().join("canonical.db"),
            (0..2).map(|i| dir.path().join(format!("shard_{}.db", i))),
        );
        let mut renderers = RendererRegistry::new();
        renderers.register("blank", Arc::new(Blank)).expect("register");
        let store = Holodeck::open(&config, renderers).expect("open store");

        let dashboard = store.dashboards().create("ops", None).expect("dashboard");
        store.metrics().create("a", dashboard.id, "blank").expect("metric a");
        store.metrics().create("b", dashboard.id, "blank").expect("metric b");
        let listed = store.dashboards().list_metrics(dashboard.id).expect("list");
        store.metrics().delete(&listed[0]).expect("delete a");

        let outcomes = store.dashboards().delete_metrics(&listed).expect("delete rest");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].metric_id(), listed[1].id.expect("id"));
        assert!(outcomes[0].is_complete());
    }
}
