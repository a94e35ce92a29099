use crate::errors::{AppError, AppResult};
use crate::models::{Metric, RenderedOutput};
use crate::samples::SampleSet;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// What a renderer gets to look at. Samples are read lazily by the renderer.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub metric: Metric,
    pub samples: SampleSet,
    pub sample_window: u32,
}

impl RenderContext {
    pub fn latest_samples(&self) -> AppResult<Vec<crate::models::Sample>> {
        self.samples.latest(self.sample_window)
    }
}

pub trait WidgetRenderer: Send + Sync {
    fn render(&self, context: &RenderContext) -> AppResult<serde_json::Value>;
}

pub type RendererFactory = Arc<dyn Fn() -> Arc<dyn WidgetRenderer> + Send + Sync>;

/// Widget type tag to renderer. Populated once at startup.
#[derive(Clone, Default)]
pub struct RendererRegistry {
    renderers: BTreeMap<String, Arc<dyn WidgetRenderer>>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_factories<I, K>(factories: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (K, RendererFactory)>,
        K: Into<String>,
    {
        let mut registry = Self::new();
        for (tag, factory) in factories {
            registry.register(tag, factory())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, tag: impl Into<String>, renderer: Arc<dyn WidgetRenderer>) -> AppResult<()> {
        let tag = tag.into();
        if tag.trim().is_empty() || tag.chars().count() > crate::metrics::MAX_WIDGET_TYPE_CHARS {
            return Err(AppError::Config(format!("invalid widget type tag '{}'", tag)));
        }
        if self.renderers.contains_key(&tag) {
            return Err(AppError::Config(format!("widget type '{}' registered twice", tag)));
        }
        self.renderers.insert(tag, renderer);
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.renderers.contains_key(tag)
    }

    pub fn resolve(&self, tag: &str) -> AppResult<Arc<dyn WidgetRenderer>> {
        self.renderers
            .get(tag)
            .cloned()
            .ok_or_else(|| AppError::UnknownWidgetType(tag.to_string()))
    }

    /// Registered tags in sorted order.
    pub fn widget_types(&self) -> Vec<String> {
        self.renderers.keys().cloned().collect()
    }

    pub fn render(&self, context: &RenderContext) -> AppResult<RenderedOutput> {
        let renderer = self.resolve(&context.metric.widget_type)?;
        let content = renderer.render(context)?;
        Ok(RenderedOutput {
            metric_id: context.samples.metric_id(),
            widget_type: context.metric.widget_type.clone(),
            content,
        })
    }
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("widget_types", &self.widget_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{RenderContext, RendererFactory, RendererRegistry, WidgetRenderer};
    use crate::errors::{AppError, AppResult};
    use std::sync::Arc;

    struct Fixed(&'static str);

    impl WidgetRenderer for Fixed {
        fn render(&self, _context: &RenderContext) -> AppResult<serde_json::Value> {
            Ok(serde_json::json!({ "kind": self.0 }))
        }
    }

    fn factory(kind: &'static str) -> RendererFactory {
        Arc::new(move || Arc::new(Fixed(kind)) as Arc<dyn WidgetRenderer>)
    }

    #[test]
    fn builds_from_factories_and_lists_sorted_tags() {
        let registry =
            RendererRegistry::from_factories([("line", factory("line")), ("counter", factory("counter"))])
                .expect("registry");
        assert_eq!(registry.widget_types(), vec!["counter", "line"]);
        assert!(registry.contains("line"));
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let registry = RendererRegistry::new();
        assert!(matches!(registry.resolve("holodeck.widgets.Line"), Err(AppError::UnknownWidgetType(_))));
    }

    #[test]
    fn duplicate_tag_is_a_config_error() {
        let result = RendererRegistry::from_factories([("line", factory("a")), ("line", factory("b"))]);
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
