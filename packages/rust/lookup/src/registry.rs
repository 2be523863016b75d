//! Source registry: the set of lookup factories a run can draw from.

use std::sync::Arc;

use pricewatch_shared::{AppConfig, PipelinePolicy, PricewatchError, Result, SourceName};

use crate::capability::SessionFactory;
use crate::html::HtmlSource;

/// Holds registered session factories in configuration order.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    factories: Vec<Arc<dyn SessionFactory>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an HTML source for every `[[sources]]` block in the config.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let policy = PipelinePolicy::from(config);
        let mut registry = Self::new();
        for source in &config.sources {
            registry.register(Arc::new(HtmlSource::from_config(
                source,
                policy.lookup_timeout,
            )?))?;
        }
        Ok(registry)
    }

    /// Add a factory. Names must be unique.
    pub fn register(&mut self, factory: Arc<dyn SessionFactory>) -> Result<()> {
        if self.get(factory.source()).is_some() {
            return Err(PricewatchError::config(format!(
                "source '{}' registered twice",
                factory.source()
            )));
        }
        self.factories.push(factory);
        Ok(())
    }

    pub fn get(&self, name: &SourceName) -> Option<Arc<dyn SessionFactory>> {
        self.factories.iter().find(|f| f.source() == name).cloned()
    }

    /// Registered source names, in registration order.
    pub fn names(&self) -> Vec<SourceName> {
        self.factories.iter().map(|f| f.source().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}
