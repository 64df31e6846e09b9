//! Construction of the orchestrator's collaborators.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

use super::cache::{CacheBackend, CacheStore};
use super::config::OrchestratorConfig;
use super::events::EventSink;
use super::persistence::{InMemoryScanPersistence, ScanPersistence};
use super::registry::ScannerRegistry;
use super::resources::{ResourceMonitor, ResourceProbe, SystemResourceProbe};
use super::runtime::InProcEventBus;
use super::target::{DefaultTargetResolver, TargetResolver};

/// Every collaborator the orchestrator needs, built once at process start.
///
/// Nothing here is global: tests and embedders construct as many contexts as
/// they like.
#[derive(Clone)]
pub struct OrchestrationContext {
    /// Validated engine settings.
    pub config: OrchestratorConfig,
    /// Scanner adapters and profiles.
    pub registry: Arc<ScannerRegistry>,
    /// Host resource sampling.
    pub monitor: Arc<ResourceMonitor>,
    /// Result cache.
    pub cache: CacheStore,
    /// Target reference resolution.
    pub resolver: Arc<dyn TargetResolver>,
    /// Job, progress and finding storage.
    pub persistence: Arc<dyn ScanPersistence>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventSink>,
}

impl fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("monitor", &self.monitor)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl OrchestrationContext {
    /// Starts a builder; unset collaborators get in-process defaults.
    pub fn builder(config: OrchestratorConfig) -> OrchestrationContextBuilder {
        OrchestrationContextBuilder {
            config,
            registry: None,
            resolver: None,
            persistence: None,
            events: None,
            probe: None,
            cache_backend: None,
        }
    }
}

/// Collects overrides; anything left unset gets the in-process default.
pub struct OrchestrationContextBuilder {
    config: OrchestratorConfig,
    registry: Option<ScannerRegistry>,
    resolver: Option<Arc<dyn TargetResolver>>,
    persistence: Option<Arc<dyn ScanPersistence>>,
    events: Option<Arc<dyn EventSink>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
}

impl fmt::Debug for OrchestrationContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationContextBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("custom_resolver", &self.resolver.is_some())
            .field("custom_persistence", &self.persistence.is_some())
            .field("custom_events", &self.events.is_some())
            .field("custom_probe", &self.probe.is_some())
            .field("cache_backend", &self.cache_backend)
            .finish()
    }
}

impl OrchestrationContextBuilder {
    /// Scanners to register. Defaults to an empty registry.
    pub fn registry(mut self, registry: ScannerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to [`DefaultTargetResolver`] in the system temp dir.
    pub fn resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Defaults to [`InMemoryScanPersistence`].
    pub fn persistence(mut self, persistence: Arc<dyn ScanPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Defaults to an [`InProcEventBus`].
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Defaults to [`SystemResourceProbe`].
    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Overrides the backend chosen from `cache.root`.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Validates the configuration and fills in defaults.
    pub fn build(self) -> Result<OrchestrationContext> {
        let config = self.config;
        config.validate()?;

        let mut registry = self.registry.unwrap_or_default();
        registry.configure(config.profiles.ema_alpha, &config.bundles);

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemResourceProbe::new()));
        let monitor = Arc::new(ResourceMonitor::new(probe, config.resources.clone()));

        let cache = match self.cache_backend {
            Some(backend) => CacheStore::new(config.cache.clone(), backend),
            None => CacheStore::from_config(config.cache.clone()),
        };

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(config.events.bus_capacity)));

        Ok(OrchestrationContext {
            registry: Arc::new(registry),
            monitor,
            cache,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(DefaultTargetResolver::default())),
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(InMemoryScanPersistence::new())),
            events,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let mut config = OrchestratorConfig::default();
        config.profiles.ema_alpha = 0.0;
        let err = OrchestrationContext::builder(config)
            .build()
            .expect_err("alpha of zero");
        assert!(matches!(err, ScanError::InvalidConfig(_)));
    }

    #[test]
    fn configured_bundles_reach_the_registry() {
        let mut config = OrchestratorConfig::default();
        config
            .bundles
            .insert("ci".into(), vec!["secret".into(), "semgrep".into()]);
        let ctx = OrchestrationContext::builder(config)
            .build()
            .expect("context");
        // Nothing is registered, so the bundle resolves to an empty set
        // rather than an unknown-bundle error.
        let resolved = ctx
            .registry
            .resolve(&crate::orchestration::job::ScannerSelection::bundle("ci"))
            .expect("known bundle");
        assert!(resolved.is_empty());
    }
}
