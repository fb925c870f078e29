//! Provider name → flow factory lookup

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::{FlowType, OAuthFlow};

/// Builds a fresh flow object. Called once per login session and once per
/// refresh, never cached.
pub type FlowFactory = Arc<dyn Fn() -> Arc<dyn OAuthFlow> + Send + Sync>;

/// Registry of configured OAuth providers.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    factories: HashMap<String, FlowFactory>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `provider`.
    pub fn register<F>(&mut self, provider: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn OAuthFlow> + Send + Sync + 'static,
    {
        let provider = provider.into();
        debug!(provider, "registered OAuth flow factory");
        self.factories.insert(provider, Arc::new(factory));
    }

    /// Builder-style `register`.
    pub fn with<F>(mut self, provider: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn OAuthFlow> + Send + Sync + 'static,
    {
        self.register(provider, factory);
        self
    }

    /// Construct a new flow instance for `provider`, if configured.
    pub fn create(&self, provider: &str) -> Option<Arc<dyn OAuthFlow>> {
        self.factories.get(provider).map(|factory| factory())
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.factories.contains_key(provider)
    }

    /// Declared flow type for `provider`, probed from a throwaway instance.
    pub fn flow_type(&self, provider: &str) -> Option<FlowType> {
        self.create(provider).map(|flow| flow.flow_type())
    }

    /// Configured provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
