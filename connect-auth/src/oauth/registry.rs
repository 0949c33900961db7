//! Provider registry keyed by `ProviderKind`.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Provider, ProviderKind};
use crate::error::{configuration_error, ConfigurationErrorKind, Error};

/// The set of provider adapters this deployment has credentials for.
#[derive(Clone, Default)]
pub struct Registry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.insert(provider.provider(), provider);
        self
    }

    /// Look up the adapter for `kind`.
    ///
    /// A provider without configured credentials is a configuration error, surfaced on first use.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>, Error> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            configuration_error(
                ConfigurationErrorKind::ProviderNotConfigured,
                &format!("No credentials configured for {}", kind),
            )
        })
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.keys().copied()
    }
}
