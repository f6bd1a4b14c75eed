//! # Provider Registry Module
//!
//! The live directory of providers known to a worker: name -> instance,
//! default tracking, and an aggregate health check. Mutations run under an
//! exclusive lock, reads under a shared one, and no lock is ever held
//! across an await point.

use crate::error::{ErrorCode, TranscriptionError};
use crate::models::ProviderInfo;
use crate::providers::Provider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Default)]
struct RegistryState {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_name: Option<String>,
}

/// Name -> provider mapping with default selection.
#[derive(Default)]
pub struct ProviderRegistry {
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name`.
    ///
    /// Rejects empty names and duplicates, and refuses providers whose
    /// configuration does not validate. The first successful registration
    /// becomes the default when none is set yet.
    pub fn register(&self, name: &str, provider: Arc<dyn Provider>) -> Result<(), TranscriptionError> {
        if name.is_empty() {
            return Err(TranscriptionError::new(
                ErrorCode::InvalidInput,
                "registry",
                "provider name cannot be empty",
            ));
        }
        provider.validate_configuration()?;

        let mut state = self.state.write().expect("registry lock poisoned");
        if state.providers.contains_key(name) {
            return Err(TranscriptionError::new(
                ErrorCode::InvalidInput,
                "registry",
                format!("provider already registered: {name}"),
            ));
        }
        state.providers.insert(name.to_string(), provider);
        if state.default_name.is_none() {
            state.default_name = Some(name.to_string());
        }
        tracing::debug!(provider = name, "registered provider");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, TranscriptionError> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| TranscriptionError::provider_not_found(name))
    }

    /// Registered names, sorted for deterministic listings.
    pub fn list(&self) -> Vec<String> {
        let state = self.state.read().expect("registry lock poisoned");
        let mut names: Vec<String> = state.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Capability sheets of every registered provider, sorted by name.
    pub fn list_info(&self) -> Vec<ProviderInfo> {
        let providers = self.snapshot();
        let mut infos: Vec<ProviderInfo> = providers.values().map(|p| p.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("registry lock poisoned").providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_provider(&self) -> Result<Arc<dyn Provider>, TranscriptionError> {
        let name = self.default_name().ok_or_else(|| {
            TranscriptionError::new(
                ErrorCode::ProviderNotFound,
                "registry",
                "no default provider set",
            )
        })?;
        self.get(&name)
    }

    pub fn default_name(&self) -> Option<String> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .default_name
            .clone()
    }

    pub fn set_default(&self, name: &str) -> Result<(), TranscriptionError> {
        let mut state = self.state.write().expect("registry lock poisoned");
        if !state.providers.contains_key(name) {
            return Err(TranscriptionError::provider_not_found(name));
        }
        state.default_name = Some(name.to_string());
        Ok(())
    }

    /// Clone the provider map out of the lock.
    pub fn snapshot(&self) -> HashMap<String, Arc<dyn Provider>> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .providers
            .clone()
    }

    /// Run every provider's health check concurrently, each bounded by
    /// `per_check_timeout`. Returns name -> outcome.
    pub async fn health_check_all(
        &self,
        per_check_timeout: Duration,
    ) -> HashMap<String, Result<(), TranscriptionError>> {
        let providers = self.snapshot();
        let checks = providers.into_iter().map(|(name, provider)| async move {
            let outcome = match tokio::time::timeout(per_check_timeout, provider.health_check()).await
            {
                Ok(result) => result,
                Err(_) => Err(TranscriptionError::network(
                    &name,
                    format!(
                        "health check timed out after {}s",
                        per_check_timeout.as_secs()
                    ),
                )),
            };
            (name, outcome)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}
