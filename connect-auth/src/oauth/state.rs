//! CSRF state management for OAuth flows.
//!
//! State values are single-use and provider-bound. The record behind a value also carries the
//! flow context (who started the flow, and the PKCE verifier) so the callback never has to trust
//! request parameters for either.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ProviderKind;
use crate::error::{validation_error, Error, ValidationErrorKind};

/// Default lifetime of a state value.
pub const DEFAULT_STATE_TTL_SECONDS: i64 = 600;

/// An issued state value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    pub value: String,
    pub provider: ProviderKind,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl OAuthState {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.ttl_seconds)
    }

    /// A value is usable up to and including `issued_at + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// Data bound to a state value for the duration of one flow.
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// The application user that started the flow.
    pub owner_id: String,
    /// PKCE verifier, as stored. Parsed again before use.
    pub pkce_verifier: Option<SecretString>,
}

/// What a state backend holds per value.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub state: OAuthState,
    pub context: FlowContext,
}

/// Keyed storage with TTL for state records.
///
/// Any deployment topology works as long as every instance shares the backend.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn insert(&self, record: StateRecord) -> Result<(), Error>;

    /// Remove the record for `value` and return it. Must be atomic: two concurrent calls for the
    /// same value cannot both receive the record.
    async fn take(&self, value: &str) -> Result<Option<StateRecord>, Error>;

    /// Drop every record that expired before `now`. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, Error>;
}

/// Single-process state backend.
#[derive(Clone, Default)]
pub struct MemoryStateBackend {
    records: Arc<Mutex<HashMap<String, StateRecord>>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn insert(&self, record: StateRecord) -> Result<(), Error> {
        let mut records = self.records.lock().await;
        records.insert(record.state.value.clone(), record);
        Ok(())
    }

    async fn take(&self, value: &str) -> Result<Option<StateRecord>, Error> {
        let mut records = self.records.lock().await;
        Ok(records.remove(value))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.state.is_expired_at(now));
        Ok(before - records.len())
    }
}

/// Manager for OAuth state parameters with expiration.
///
/// Generates and validates CSRF state tokens to prevent cross-site request forgery attacks.
#[derive(Clone)]
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
    ttl: Duration,
}

impl StateManager {
    /// Create a state manager with the default TTL of 10 minutes.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self::with_ttl(backend, Duration::seconds(DEFAULT_STATE_TTL_SECONDS))
    }

    /// Create a state manager with a custom TTL.
    pub fn with_ttl(backend: Arc<dyn StateBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new state value for `provider` and record the flow context behind it.
    pub async fn issue(
        &self,
        provider: ProviderKind,
        context: FlowContext,
    ) -> Result<OAuthState, Error> {
        let state = OAuthState {
            value: Self::generate_token(),
            provider,
            issued_at: Utc::now(),
            ttl_seconds: self.ttl.num_seconds(),
        };

        self.backend
            .insert(StateRecord {
                state: state.clone(),
                context,
            })
            .await?;

        debug!(
            "Issued OAuth state {}… for provider {}",
            &state.value[..8],
            provider
        );
        Ok(state)
    }

    /// Consume a state value, returning true exactly once for a live value issued for
    /// `provider`.
    pub async fn consume(&self, value: &str, provider: ProviderKind) -> bool {
        self.take(value, provider).await.is_ok()
    }

    /// Consume a state value and return its flow context.
    ///
    /// The record is destroyed by any attempt, valid or not, so a value can never be replayed.
    pub async fn take(&self, value: &str, provider: ProviderKind) -> Result<FlowContext, Error> {
        self.take_at(value, provider, Utc::now()).await
    }

    pub(crate) async fn take_at(
        &self,
        value: &str,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Result<FlowContext, Error> {
        if value.is_empty() {
            return Err(validation_error(
                ValidationErrorKind::MissingState,
                "No state value supplied",
            ));
        }

        let record = self.backend.take(value).await?.ok_or_else(|| {
            warn!("Rejected unknown or already used OAuth state for {}", provider);
            validation_error(ValidationErrorKind::InvalidState, "Unknown state value")
        })?;

        if record.state.provider != provider {
            warn!(
                "Rejected OAuth state issued for {} presented to {}",
                record.state.provider, provider
            );
            return Err(validation_error(
                ValidationErrorKind::ProviderMismatch,
                "State was issued for a different provider",
            ));
        }

        if record.state.is_expired_at(now) {
            warn!("Rejected expired OAuth state for {}", provider);
            return Err(validation_error(
                ValidationErrorKind::ExpiredState,
                "State value expired",
            ));
        }

        Ok(record.context)
    }

    /// Clean up expired states.
    ///
    /// Expired values are unusable either way; this only reclaims space.
    pub async fn purge_expired(&self) -> Result<usize, Error> {
        self.backend.purge_expired(Utc::now()).await
    }

    /// Generate a cryptographically random state token (256 bits).
    fn generate_token() -> String {
        let random_bytes: [u8; 32] = rand::thread_rng().gen();
        hex::encode(random_bytes)
    }
}
