//! Token storage trait and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::TokenSet;
use crate::error::Error;
use crate::oauth::ProviderKind;

/// Trait for token storage backends.
///
/// Every write replaces the whole record for a (user, provider) key; records are never merged.
/// Encryption at rest is the backend's concern.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store tokens, replacing any existing record for `tokens.owner_id` and `tokens.provider`.
    async fn store(&self, tokens: TokenSet) -> Result<(), Error>;

    /// Retrieve tokens for a user and provider.
    ///
    /// # Returns
    ///
    /// `Some(TokenSet)` if found, `None` if not found.
    async fn get(&self, owner_id: &str, provider: ProviderKind) -> Result<Option<TokenSet>, Error>;

    /// Atomically replace tokens if the stored record is still the one that was refreshed.
    ///
    /// Guards against a slow refresh overwriting a newer link or refresh result.
    ///
    /// # Arguments
    ///
    /// * `expected_obtained_at` - `obtained_at` of the record the refresh started from
    /// * `new_tokens` - The replacement
    ///
    /// # Returns
    ///
    /// `Ok(true)` if replaced, `Ok(false)` if the stored record changed or disappeared.
    async fn update_atomic(
        &self,
        expected_obtained_at: DateTime<Utc>,
        new_tokens: TokenSet,
    ) -> Result<bool, Error>;

    /// Find every application user linked to a provider-side account id.
    ///
    /// Several users may link the same provider account; all of them are returned.
    async fn find_owners(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Vec<String>, Error>;

    /// Delete tokens for a user and provider. Deleting a missing record is not an error.
    async fn delete(&self, owner_id: &str, provider: ProviderKind) -> Result<(), Error>;
}

type Key = (String, ProviderKind);

/// Token storage kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tokens: Arc<RwLock<HashMap<Key, TokenSet>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(owner_id: &str, provider: ProviderKind) -> Key {
        (owner_id.to_string(), provider)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, tokens: TokenSet) -> Result<(), Error> {
        let mut map = self.tokens.write().await;
        map.insert(Self::key(&tokens.owner_id, tokens.provider), tokens);
        Ok(())
    }

    async fn get(&self, owner_id: &str, provider: ProviderKind) -> Result<Option<TokenSet>, Error> {
        let map = self.tokens.read().await;
        Ok(map.get(&Self::key(owner_id, provider)).cloned())
    }

    async fn update_atomic(
        &self,
        expected_obtained_at: DateTime<Utc>,
        new_tokens: TokenSet,
    ) -> Result<bool, Error> {
        let mut map = self.tokens.write().await;
        let key = Self::key(&new_tokens.owner_id, new_tokens.provider);

        match map.get(&key) {
            Some(current) if current.obtained_at == expected_obtained_at => {
                map.insert(key, new_tokens);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_owners(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Vec<String>, Error> {
        let map = self.tokens.read().await;
        let mut owners: Vec<String> = map
            .values()
            .filter(|tokens| {
                tokens.provider == provider && tokens.account_id.as_deref() == Some(account_id)
            })
            .map(|tokens| tokens.owner_id.clone())
            .collect();
        owners.sort();
        Ok(owners)
    }

    async fn delete(&self, owner_id: &str, provider: ProviderKind) -> Result<(), Error> {
        let mut map = self.tokens.write().await;
        map.remove(&Self::key(owner_id, provider));
        Ok(())
    }
}

/// Lets a [`Manager`](super::Manager) be built over a shared, type-erased backend.
#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn store(&self, tokens: TokenSet) -> Result<(), Error> {
        (**self).store(tokens).await
    }

    async fn get(&self, owner_id: &str, provider: ProviderKind) -> Result<Option<TokenSet>, Error> {
        (**self).get(owner_id, provider).await
    }

    async fn update_atomic(
        &self,
        expected_obtained_at: DateTime<Utc>,
        new_tokens: TokenSet,
    ) -> Result<bool, Error> {
        (**self).update_atomic(expected_obtained_at, new_tokens).await
    }

    async fn find_owners(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Vec<String>, Error> {
        (**self).find_owners(provider, account_id).await
    }

    async fn delete(&self, owner_id: &str, provider: ProviderKind) -> Result<(), Error> {
        (**self).delete(owner_id, provider).await
    }
}
