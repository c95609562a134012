//! Provider registry: one adapter per (provider, environment).
//!
//! Adapters are built lazily from a resolved credential and cached, so the
//! orchestrator can be shared by many callers without rebuilding clients.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::config::EngineConfig;
use crate::credential::{Credential, CredentialResolver};
use crate::error::LifecycleError;

use super::{ProviderKind, VolumeProvider, block, claim, disk, export};

/// Builds an adapter from its credential and the engine configuration.
pub type ProviderFactory = Arc<
    dyn Fn(&Credential, &EngineConfig) -> Result<Arc<dyn VolumeProvider>, LifecycleError>
        + Send
        + Sync,
>;

type CacheKey = (ProviderKind, String);

/// Maps provider kinds to adapter factories and caches built adapters.
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, ProviderFactory>,
    resolver: Arc<dyn CredentialResolver>,
    config: EngineConfig,
    cache: Mutex<HashMap<CacheKey, Arc<dyn VolumeProvider>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("supported", &self.supported())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Registry without any factories.
    #[must_use]
    pub fn new(resolver: Arc<dyn CredentialResolver>, config: EngineConfig) -> Self {
        Self {
            factories: HashMap::new(),
            resolver,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the four built-in backend families.
    #[must_use]
    pub fn with_builtin(resolver: Arc<dyn CredentialResolver>, config: EngineConfig) -> Self {
        Self::new(resolver, config)
            .with_factory(ProviderKind::BlockStorage, Arc::new(block::build))
            .with_factory(ProviderKind::ComputeDisk, Arc::new(disk::build))
            .with_factory(ProviderKind::NetworkExport, Arc::new(export::build))
            .with_factory(ProviderKind::ContainerVolume, Arc::new(claim::build))
    }

    /// Registers (or replaces) the factory for `kind`.
    #[must_use]
    pub fn with_factory(mut self, kind: ProviderKind, factory: ProviderFactory) -> Self {
        self.factories.insert(kind, factory);
        self.invalidate_kind(kind);
        self
    }

    /// Engine configuration handed to factories.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provider kinds with a registered factory, in canonical order.
    #[must_use]
    pub fn supported(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.factories.contains_key(kind))
            .collect()
    }

    /// Returns the adapter for `kind` in `environment`, building it on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotSupported`] when no factory is registered,
    /// [`LifecycleError::Credential`] when the credential is missing or
    /// incomplete, or whatever the factory raises.
    pub fn resolve(
        &self,
        kind: ProviderKind,
        environment: &str,
    ) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
        let key = (kind, environment.trim().to_owned());
        if let Some(adapter) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(adapter));
        }

        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| LifecycleError::not_supported(kind.as_str(), "provider"))?;
        let credential = self.resolver.resolve(kind, &key.1)?;
        credential.validate()?;
        let adapter = factory(&credential, &self.config)?;
        debug!(provider = %kind, environment = %key.1, "built provider adapter");

        let mut cache = self.lock_cache();
        let cached = cache.entry(key).or_insert(adapter);
        Ok(Arc::clone(cached))
    }

    /// Drops the cached adapter for one (provider, environment), for example
    /// after its credential rotated.
    pub fn invalidate(&self, kind: ProviderKind, environment: &str) {
        self.lock_cache()
            .remove(&(kind, environment.trim().to_owned()));
    }

    /// Drops every cached adapter.
    pub fn invalidate_all(&self) {
        self.lock_cache().clear();
    }

    fn invalidate_kind(&self, kind: ProviderKind) {
        self.lock_cache().retain(|(cached, _), _| *cached != kind);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Arc<dyn VolumeProvider>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
