//! Token lifecycle manager with per-link refresh locking.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{LinkState, LinkStatus, Storage, TokenSet};
use crate::error::{validation_error, Error, ValidationErrorKind};
use crate::oauth::{
    FlowContext, OAuthState, PkcePair, PkceVerifier, ProviderKind, RefreshOutcome, Registry,
    StateManager,
};

/// Default window before expiry in which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECONDS: i64 = 60;

/// Where to send the user to authorize, and the state value to carry alongside.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: OAuthState,
}

/// Result of asking for a usable access token.
#[derive(Debug, Clone)]
pub enum TokenAccess {
    /// A token set valid for at least the refresh margin.
    Fresh(TokenSet),
    /// The link is expired; the user has to link the provider again.
    ReauthorizationRequired,
}

impl TokenAccess {
    pub fn access_token(&self) -> Option<&SecretString> {
        match self {
            TokenAccess::Fresh(tokens) => Some(&tokens.access_token),
            TokenAccess::ReauthorizationRequired => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey {
    owner_id: String,
    provider: ProviderKind,
}

impl LinkKey {
    fn new(owner_id: &str, provider: ProviderKind) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            provider,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkRecord {
    state: LinkState,
    since: DateTime<Utc>,
    /// State before a pending link began; restored if the flow is abandoned.
    resume: Option<LinkState>,
}

/// Owns the link state machine per (user, provider):
/// `Unlinked → LinkPending → Linked → Refreshing → Linked | Expired → Unlinked`.
///
/// Refreshes are single-flight per key. Concurrent callers for the same key wait on one lock;
/// whoever gets it second re-reads storage and finds the refreshed token instead of refreshing
/// again, which rotating providers would reject or answer by invalidating the sibling's token.
pub struct Manager<S: Storage> {
    storage: S,
    registry: Arc<Registry>,
    states: StateManager,
    link_states: DashMap<LinkKey, LinkRecord>,
    refresh_locks: DashMap<LinkKey, Arc<Mutex<()>>>,
    refresh_margin: Duration,
}

impl<S: Storage> Manager<S> {
    /// Create a new token manager with the given storage backend.
    pub fn new(storage: S, registry: Arc<Registry>, states: StateManager) -> Self {
        Self {
            storage,
            registry,
            states,
            link_states: DashMap::new(),
            refresh_locks: DashMap::new(),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECONDS),
        }
    }

    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    /// Begin linking `provider` for `owner_id`.
    ///
    /// Issues a state value (and a PKCE pair when the provider supports it), binds both to the
    /// owner, and returns the provider authorization URL.
    pub async fn start_link(
        &self,
        owner_id: &str,
        provider: ProviderKind,
    ) -> Result<AuthorizationRequest, Error> {
        let adapter = self.registry.get(provider)?;
        let capabilities = adapter.capabilities();

        let pkce = capabilities.supports_pkce.then(PkcePair::generate);
        let context = FlowContext {
            owner_id: owner_id.to_string(),
            pkce_verifier: pkce
                .as_ref()
                .map(|pair| SecretString::new(pair.verifier.expose().to_string())),
        };

        let state = self.states.issue(provider, context).await?;
        let url = adapter.authorization_url(
            &state.value,
            &capabilities.scopes_required,
            pkce.as_ref().map(|pair| &pair.challenge),
        )?;

        self.begin_pending(owner_id, provider).await;
        info!("Started {} link for user {}", provider, owner_id);

        Ok(AuthorizationRequest { url, state })
    }

    /// Finish a link from the provider callback.
    ///
    /// The state value is consumed first; the owner comes from the flow context bound to it.
    /// On any failure after that the pending link is abandoned and the code is not retried.
    pub async fn complete_link(
        &self,
        provider: ProviderKind,
        code: &str,
        state: &str,
    ) -> Result<LinkStatus, Error> {
        let context = self.states.take(state, provider).await?;
        let owner_id = context.owner_id.clone();

        match self.exchange(provider, code, context).await {
            Ok(tokens) => {
                let status = LinkStatus::from_tokens(&tokens, LinkState::Linked);
                self.storage.store(tokens).await?;
                self.set_link_state(&owner_id, provider, LinkState::Linked);
                info!("Linked {} for user {}", provider, owner_id);
                Ok(status)
            }
            Err(e) => {
                warn!("Failed to link {} for user {}: {}", provider, owner_id, e);
                self.abandon_pending(&owner_id, provider).await;
                Err(e)
            }
        }
    }

    /// Handle a callback where the user declined consent on the provider side.
    ///
    /// The state value is consumed so it cannot be used afterwards.
    pub async fn decline_link(&self, provider: ProviderKind, state: &str) -> Result<(), Error> {
        let context = self.states.take(state, provider).await?;
        info!("User {} declined {} authorization", context.owner_id, provider);
        self.abandon_pending(&context.owner_id, provider).await;
        Ok(())
    }

    /// Abandon a pending link after the provider declined or the callback failed.
    ///
    /// The key returns to where it was before the flow began: an expired link stays expired, a
    /// working link stays linked, and a key without tokens is unlinked.
    pub async fn abandon_pending(&self, owner_id: &str, provider: ProviderKind) {
        let key = LinkKey::new(owner_id, provider);
        let has_tokens = matches!(self.storage.get(owner_id, provider).await, Ok(Some(_)));
        let resume = self.link_states.get(&key).and_then(|record| record.resume);
        self.set_link_state(owner_id, provider, resumed_state(resume, has_tokens));
    }

    async fn begin_pending(&self, owner_id: &str, provider: ProviderKind) {
        let key = LinkKey::new(owner_id, provider);
        let resume = match self.link_states.get(&key).map(|record| *record) {
            // A second start while pending keeps the state from before the first one.
            Some(LinkRecord {
                state: LinkState::LinkPending,
                resume,
                ..
            }) => resume,
            Some(record) => Some(record.state),
            None => None,
        };
        let resume = match resume {
            Some(state) => state,
            None => match self.storage.get(owner_id, provider).await {
                Ok(Some(_)) => LinkState::Linked,
                _ => LinkState::Unlinked,
            },
        };

        self.link_states.insert(
            key,
            LinkRecord {
                state: LinkState::LinkPending,
                since: Utc::now(),
                resume: Some(resume),
            },
        );
    }

    async fn exchange(
        &self,
        provider: ProviderKind,
        code: &str,
        context: FlowContext,
    ) -> Result<TokenSet, Error> {
        let adapter = self.registry.get(provider)?;

        let verifier = match context.pkce_verifier {
            Some(raw) => Some(PkceVerifier::parse(raw.expose_secret())?),
            None if adapter.capabilities().supports_pkce => {
                return Err(validation_error(
                    ValidationErrorKind::MissingPkceVerifier,
                    "Flow context has no PKCE verifier",
                ))
            }
            None => None,
        };

        adapter
            .exchange_code(
                &context.owner_id,
                code,
                adapter.redirect_uri(),
                verifier.as_ref(),
            )
            .await
    }

    /// Get a usable token set for a user, refreshing if it is within the refresh margin.
    ///
    /// Never returns a token past its expiry: if the refresh is impossible or refused, the link
    /// moves to `Expired` and the caller gets `TokenAccess::ReauthorizationRequired`. Transport
    /// failures leave the link `Linked` and surface as errors.
    pub async fn ensure_fresh_token(
        &self,
        owner_id: &str,
        provider: ProviderKind,
    ) -> Result<TokenAccess, Error> {
        let key = LinkKey::new(owner_id, provider);

        if self.current_state(&key) == Some(LinkState::Expired) {
            return Ok(TokenAccess::ReauthorizationRequired);
        }

        let tokens = self.stored_tokens(owner_id, provider).await?;
        if !tokens.needs_refresh(Utc::now(), self.refresh_margin) {
            return Ok(TokenAccess::Fresh(tokens));
        }

        debug!("Token for user {} on {} needs refresh", owner_id, provider);

        // Get or create a lock for this link
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed, or failed to, while we waited.
        if self.current_state(&key) == Some(LinkState::Expired) {
            return Ok(TokenAccess::ReauthorizationRequired);
        }
        let tokens = self.stored_tokens(owner_id, provider).await?;
        if !tokens.needs_refresh(Utc::now(), self.refresh_margin) {
            debug!("Token was refreshed by another request");
            return Ok(TokenAccess::Fresh(tokens));
        }

        let adapter = self.registry.get(provider)?;
        self.set_link_state(owner_id, provider, LinkState::Refreshing);

        let outcome = adapter.refresh(&tokens).await;
        let result = self.settle_refresh(&tokens, outcome).await;

        let next = match &result {
            Ok(TokenAccess::Fresh(_)) => LinkState::Linked,
            Ok(TokenAccess::ReauthorizationRequired) => LinkState::Expired,
            Err(e) if is_not_linked(e) => LinkState::Unlinked,
            Err(_) => LinkState::Linked,
        };
        self.set_link_state(owner_id, provider, next);

        result
    }

    async fn settle_refresh(
        &self,
        previous: &TokenSet,
        outcome: Result<RefreshOutcome, Error>,
    ) -> Result<TokenAccess, Error> {
        match outcome {
            Ok(RefreshOutcome::Refreshed(tokens)) => {
                if self
                    .storage
                    .update_atomic(previous.obtained_at, tokens.clone())
                    .await?
                {
                    debug!(
                        "Token refreshed successfully for user {} on {}",
                        tokens.owner_id, tokens.provider
                    );
                    return Ok(TokenAccess::Fresh(tokens));
                }

                // The record changed while refreshing (unlinked, or linked again); keep that one.
                debug!("Discarding refresh result superseded by a newer record");
                let current = self
                    .stored_tokens(&previous.owner_id, previous.provider)
                    .await?;
                Ok(TokenAccess::Fresh(current))
            }
            Ok(RefreshOutcome::ReauthorizationRequired) => {
                info!(
                    "{} cannot refresh tokens for user {}; re-authorization required",
                    previous.provider, previous.owner_id
                );
                Ok(TokenAccess::ReauthorizationRequired)
            }
            Err(e) if e.is_provider_rejection() => {
                warn!(
                    "{} rejected token refresh for user {}: {}",
                    previous.provider, previous.owner_id, e
                );
                Ok(TokenAccess::ReauthorizationRequired)
            }
            Err(e) => {
                warn!(
                    "Token refresh for user {} on {} failed: {}",
                    previous.owner_id, previous.provider, e
                );
                Err(e)
            }
        }
    }

    /// Discard the token set and unlink. Unlinking an unlinked key succeeds.
    pub async fn unlink(&self, owner_id: &str, provider: ProviderKind) -> Result<(), Error> {
        let key = LinkKey::new(owner_id, provider);
        self.storage.delete(owner_id, provider).await?;
        self.set_link_state(owner_id, provider, LinkState::Unlinked);
        // A lock still held by an in-flight refresh must stay shared with later callers.
        self.refresh_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        info!("Unlinked {} for user {}", provider, owner_id);
        Ok(())
    }

    /// Unlink every user linked to `account_id` on `provider`.
    ///
    /// # Returns
    ///
    /// The owners that were unlinked; empty if no link matched.
    pub async fn unlink_account(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Vec<String>, Error> {
        let owners = self.storage.find_owners(provider, account_id).await?;
        for owner_id in &owners {
            self.unlink(owner_id, provider).await?;
        }
        Ok(owners)
    }

    /// Find the application users linked to a provider-side account.
    pub async fn find_owners(
        &self,
        provider: ProviderKind,
        account_id: &str,
    ) -> Result<Vec<String>, Error> {
        self.storage.find_owners(provider, account_id).await
    }

    /// Current lifecycle state and a secret-free summary of the link.
    pub async fn status(&self, owner_id: &str, provider: ProviderKind) -> Result<LinkStatus, Error> {
        let key = LinkKey::new(owner_id, provider);
        let tokens = self.storage.get(owner_id, provider).await?;

        let state = match self.link_states.get(&key).map(|r| *r) {
            Some(LinkRecord {
                state: LinkState::LinkPending,
                since,
                resume,
            }) if Utc::now() > since + self.states.ttl() => {
                // The flow was abandoned and its state value has expired.
                resumed_state(resume, tokens.is_some())
            }
            Some(record) => record.state,
            None if tokens.is_some() => LinkState::Linked,
            None => LinkState::Unlinked,
        };

        Ok(match (&tokens, state) {
            (Some(tokens), LinkState::Linked | LinkState::Refreshing | LinkState::Expired) => {
                LinkStatus::from_tokens(tokens, state)
            }
            _ => LinkStatus::new(owner_id, provider, state),
        })
    }

    async fn stored_tokens(&self, owner_id: &str, provider: ProviderKind) -> Result<TokenSet, Error> {
        self.storage.get(owner_id, provider).await?.ok_or_else(|| {
            validation_error(
                ValidationErrorKind::NotLinked,
                &format!("No {} tokens for user {}", provider, owner_id),
            )
        })
    }

    fn current_state(&self, key: &LinkKey) -> Option<LinkState> {
        self.link_states.get(key).map(|record| record.state)
    }

    fn set_link_state(&self, owner_id: &str, provider: ProviderKind, state: LinkState) {
        self.link_states.insert(
            LinkKey::new(owner_id, provider),
            LinkRecord {
                state,
                since: Utc::now(),
                resume: None,
            },
        );
    }
}

/// State a key falls back to when a pending link is abandoned.
fn resumed_state(resume: Option<LinkState>, has_tokens: bool) -> LinkState {
    match (resume, has_tokens) {
        (_, false) => LinkState::Unlinked,
        (Some(LinkState::Expired), true) => LinkState::Expired,
        (_, true) => LinkState::Linked,
    }
}

fn is_not_linked(err: &Error) -> bool {
    err.error_kind == crate::error::ErrorKind::Validation(ValidationErrorKind::NotLinked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, UpstreamErrorKind};
    use crate::oauth::testing::{FakeProvider, FakeRefresh};
    use crate::oauth::token::MemoryStorage;
    use crate::oauth::MemoryStateBackend;
    use std::time::Duration as StdDuration;

    struct Harness {
        manager: Arc<Manager<MemoryStorage>>,
        provider: Arc<FakeProvider>,
        storage: MemoryStorage,
    }

    fn harness(provider: FakeProvider) -> Harness {
        let provider = Arc::new(provider);
        let mut registry = Registry::new();
        registry.register(provider.clone());

        let storage = MemoryStorage::new();
        let manager = Manager::new(
            storage.clone(),
            Arc::new(registry),
            StateManager::new(Arc::new(MemoryStateBackend::new())),
        );

        Harness {
            manager: Arc::new(manager),
            provider,
            storage,
        }
    }

    fn stored(owner_id: &str, provider: ProviderKind, age_seconds: i64) -> TokenSet {
        TokenSet {
            provider,
            owner_id: owner_id.to_string(),
            account_id: Some(format!("acct-{}", owner_id)),
            access_token: SecretString::new("original".to_string()),
            refresh_token: Some(SecretString::new("refresh".to_string())),
            obtained_at: Utc::now() - Duration::seconds(age_seconds),
            expires_in_seconds: 3600,
            scope: vec!["read".to_string()],
        }
    }

    fn access(result: &TokenAccess) -> String {
        result
            .access_token()
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_full_link_flow() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok).with_account_id("open-1"));

        let request = h
            .manager
            .start_link("user-1", ProviderKind::TikTok)
            .await
            .unwrap();
        assert_eq!(
            h.manager
                .status("user-1", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::LinkPending
        );
        assert!(request
            .url
            .query_pairs()
            .any(|(k, v)| k == "state" && v == request.state.value.as_str()));

        let status = h
            .manager
            .complete_link(ProviderKind::TikTok, "code-1", &request.state.value)
            .await
            .unwrap();
        assert_eq!(status.state, LinkState::Linked);
        assert_eq!(status.owner_id, "user-1");
        assert_eq!(status.account_id.as_deref(), Some("open-1"));

        let tokens = h
            .storage
            .get("user-1", ProviderKind::TikTok)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "access-for-code-1");
    }

    #[tokio::test]
    async fn test_pkce_verifier_travels_with_state() {
        let h = harness(FakeProvider::new(ProviderKind::GooglePhotos));

        let request = h
            .manager
            .start_link("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();
        let challenge = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "code_challenge")
            .map(|(_, v)| v.to_string())
            .unwrap();

        h.manager
            .complete_link(ProviderKind::GooglePhotos, "code", &request.state.value)
            .await
            .unwrap();

        let verifier = PkceVerifier::parse(&h.provider.last_verifier().unwrap()).unwrap();
        assert_eq!(verifier.challenge().as_str(), challenge);
    }

    #[tokio::test]
    async fn test_no_pkce_for_providers_without_support() {
        let h = harness(FakeProvider::new(ProviderKind::Instagram).without_pkce());

        let request = h
            .manager
            .start_link("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        assert!(!request.url.query_pairs().any(|(k, _)| k == "code_challenge"));

        h.manager
            .complete_link(ProviderKind::Instagram, "code", &request.state.value)
            .await
            .unwrap();
        assert!(h.provider.last_verifier().is_none());
    }

    #[tokio::test]
    async fn test_complete_link_rejects_replayed_state() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        let request = h
            .manager
            .start_link("user-1", ProviderKind::TikTok)
            .await
            .unwrap();

        h.manager
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap();
        let err = h
            .manager
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::Validation(ValidationErrorKind::InvalidState)
        );
        assert_eq!(h.provider.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_exchange_unlinks_and_is_not_retried() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok).failing_exchange());
        let request = h
            .manager
            .start_link("user-1", ProviderKind::TikTok)
            .await
            .unwrap();

        let err = h
            .manager
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::Upstream(UpstreamErrorKind::Rejected { status: 400 })
        );
        assert_eq!(h.provider.exchange_calls(), 1);
        assert_eq!(
            h.manager
                .status("user-1", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
    }

    #[tokio::test]
    async fn test_declined_link_burns_state() {
        let h = harness(FakeProvider::new(ProviderKind::GooglePhotos));
        let request = h
            .manager
            .start_link("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();

        h.manager
            .decline_link(ProviderKind::GooglePhotos, &request.state.value)
            .await
            .unwrap();

        assert_eq!(
            h.manager
                .status("user-1", ProviderKind::GooglePhotos)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
        assert!(h
            .manager
            .complete_link(ProviderKind::GooglePhotos, "code", &request.state.value)
            .await
            .is_err());
        assert_eq!(h.provider.exchange_calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_leaves_young_token_untouched() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 100))
            .await
            .unwrap();

        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::TikTok)
            .await
            .unwrap();

        assert_eq!(access(&result), "original");
        assert_eq!(h.provider.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_refreshes_inside_margin() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 3550))
            .await
            .unwrap();

        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::TikTok)
            .await
            .unwrap();

        assert_eq!(access(&result), "refreshed-1");
        assert_eq!(h.provider.refresh_calls(), 1);
        let status = h.manager.status("user-1", ProviderKind::TikTok).await.unwrap();
        assert_eq!(status.state, LinkState::Linked);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_single_flight() {
        let h = harness(
            FakeProvider::new(ProviderKind::TikTok)
                .with_refresh_delay(StdDuration::from_millis(50)),
        );
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 4000))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .ensure_fresh_token("user-1", ProviderKind::TikTok)
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(access(&result), "refreshed-1");
        }
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_refresh_independently() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 4000))
            .await
            .unwrap();
        h.storage
            .store(stored("user-2", ProviderKind::TikTok, 4000))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            h.manager.ensure_fresh_token("user-1", ProviderKind::TikTok),
            h.manager.ensure_fresh_token("user-2", ProviderKind::TikTok)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.provider.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_provider_without_refresh_expires_link() {
        let h = harness(FakeProvider::new(ProviderKind::Instagram).without_refresh());
        h.storage
            .store(stored("user-1", ProviderKind::Instagram, 4000))
            .await
            .unwrap();

        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::Instagram)
            .await
            .unwrap();

        assert!(matches!(result, TokenAccess::ReauthorizationRequired));
        assert!(result.access_token().is_none());
        let status = h
            .manager
            .status("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        assert_eq!(status.state, LinkState::Expired);
    }

    #[tokio::test]
    async fn test_rejected_refresh_expires_link() {
        let h = harness(
            FakeProvider::new(ProviderKind::GooglePhotos)
                .with_refresh_behavior(FakeRefresh::Reject { status: 400 }),
        );
        h.storage
            .store(stored("user-1", ProviderKind::GooglePhotos, 4000))
            .await
            .unwrap();

        let first = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();
        let second = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();

        assert!(matches!(first, TokenAccess::ReauthorizationRequired));
        assert!(matches!(second, TokenAccess::ReauthorizationRequired));
        // Expired links are not refreshed again until the user re-links.
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_timeout_surfaces_error_without_stale_token() {
        let h = harness(
            FakeProvider::new(ProviderKind::TikTok).with_refresh_behavior(FakeRefresh::Timeout),
        );
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 4000))
            .await
            .unwrap();

        let err = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::TikTok)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Upstream(UpstreamErrorKind::Timeout));

        // Transient failure: the next call tries again.
        h.provider.set_refresh_behavior(FakeRefresh::Succeed);
        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::TikTok)
            .await
            .unwrap();
        assert_eq!(access(&result), "refreshed-2");
    }

    #[tokio::test]
    async fn test_ensure_fresh_token_when_not_linked() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        let err = h
            .manager
            .ensure_fresh_token("nobody", ProviderKind::TikTok)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Validation(ValidationErrorKind::NotLinked)
        );
    }

    #[tokio::test]
    async fn test_unlink_is_idempotent() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 0))
            .await
            .unwrap();

        h.manager.unlink("user-1", ProviderKind::TikTok).await.unwrap();
        h.manager.unlink("user-1", ProviderKind::TikTok).await.unwrap();

        let status = h.manager.status("user-1", ProviderKind::TikTok).await.unwrap();
        assert_eq!(status.state, LinkState::Unlinked);
        assert!(h
            .storage
            .get("user-1", ProviderKind::TikTok)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_relink_clears_expired_state() {
        let h = harness(FakeProvider::new(ProviderKind::Instagram).without_refresh());
        h.storage
            .store(stored("user-1", ProviderKind::Instagram, 4000))
            .await
            .unwrap();
        h.manager
            .ensure_fresh_token("user-1", ProviderKind::Instagram)
            .await
            .unwrap();

        let request = h
            .manager
            .start_link("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        h.manager
            .complete_link(ProviderKind::Instagram, "new", &request.state.value)
            .await
            .unwrap();

        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        assert_eq!(access(&result), "access-for-new");
    }

    #[tokio::test]
    async fn test_unlink_account_by_provider_account_id() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("42", ProviderKind::TikTok, 0))
            .await
            .unwrap();

        let owners = h
            .manager
            .unlink_account(ProviderKind::TikTok, "acct-42")
            .await
            .unwrap();
        assert_eq!(owners, vec!["42".to_string()]);

        let again = h
            .manager
            .unlink_account(ProviderKind::TikTok, "acct-42")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_unlink_account_unlinks_every_owner() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        let mut shared = stored("7", ProviderKind::TikTok, 0);
        shared.account_id = Some("acct-42".to_string());
        h.storage
            .store(stored("42", ProviderKind::TikTok, 0))
            .await
            .unwrap();
        h.storage.store(shared).await.unwrap();

        let owners = h
            .manager
            .unlink_account(ProviderKind::TikTok, "acct-42")
            .await
            .unwrap();
        assert_eq!(owners.len(), 2);

        for owner in ["42", "7"] {
            let status = h.manager.status(owner, ProviderKind::TikTok).await.unwrap();
            assert_eq!(status.state, LinkState::Unlinked);
        }
    }

    #[tokio::test]
    async fn test_declined_relink_keeps_link_expired() {
        let h = harness(
            FakeProvider::new(ProviderKind::GooglePhotos)
                .with_refresh_behavior(FakeRefresh::Reject { status: 400 }),
        );
        h.storage
            .store(stored("user-1", ProviderKind::GooglePhotos, 4000))
            .await
            .unwrap();
        h.manager
            .ensure_fresh_token("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();

        let request = h
            .manager
            .start_link("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();
        h.manager
            .decline_link(ProviderKind::GooglePhotos, &request.state.value)
            .await
            .unwrap();

        let status = h
            .manager
            .status("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();
        assert_eq!(status.state, LinkState::Expired);

        let result = h
            .manager
            .ensure_fresh_token("user-1", ProviderKind::GooglePhotos)
            .await
            .unwrap();
        assert!(matches!(result, TokenAccess::ReauthorizationRequired));
        assert_eq!(h.provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_relink_keeps_link_expired() {
        let h = harness(
            FakeProvider::new(ProviderKind::Instagram)
                .without_refresh()
                .failing_exchange(),
        );
        h.storage
            .store(stored("user-1", ProviderKind::Instagram, 4000))
            .await
            .unwrap();
        h.manager
            .ensure_fresh_token("user-1", ProviderKind::Instagram)
            .await
            .unwrap();

        // Starting twice keeps the state from before the first start.
        h.manager
            .start_link("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        let request = h
            .manager
            .start_link("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        assert!(h
            .manager
            .complete_link(ProviderKind::Instagram, "code", &request.state.value)
            .await
            .is_err());

        let status = h
            .manager
            .status("user-1", ProviderKind::Instagram)
            .await
            .unwrap();
        assert_eq!(status.state, LinkState::Expired);
    }

    #[tokio::test]
    async fn test_declined_relink_keeps_working_link() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 0))
            .await
            .unwrap();

        let request = h
            .manager
            .start_link("user-1", ProviderKind::TikTok)
            .await
            .unwrap();
        h.manager
            .decline_link(ProviderKind::TikTok, &request.state.value)
            .await
            .unwrap();

        let status = h.manager.status("user-1", ProviderKind::TikTok).await.unwrap();
        assert_eq!(status.state, LinkState::Linked);
    }

    #[test]
    fn test_resumed_state() {
        assert_eq!(resumed_state(Some(LinkState::Expired), true), LinkState::Expired);
        assert_eq!(resumed_state(Some(LinkState::Linked), true), LinkState::Linked);
        assert_eq!(resumed_state(Some(LinkState::Refreshing), true), LinkState::Linked);
        assert_eq!(resumed_state(None, true), LinkState::Linked);
        assert_eq!(resumed_state(Some(LinkState::Expired), false), LinkState::Unlinked);
    }

    #[tokio::test]
    async fn test_unlink_keeps_refresh_lock_held_by_in_flight_refresh() {
        let h = harness(FakeProvider::new(ProviderKind::TikTok));
        h.storage
            .store(stored("user-1", ProviderKind::TikTok, 0))
            .await
            .unwrap();
        let key = LinkKey::new("user-1", ProviderKind::TikTok);

        let held = h
            .manager
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = held.lock().await;

        h.manager.unlink("user-1", ProviderKind::TikTok).await.unwrap();
        let shared = h.manager.refresh_locks.get(&key).map(|lock| lock.clone());
        assert!(shared.is_some_and(|lock| Arc::ptr_eq(&lock, &held)));

        drop(guard);
        drop(held);
        h.manager.unlink("user-1", ProviderKind::TikTok).await.unwrap();
        assert!(h.manager.refresh_locks.get(&key).is_none());
    }
}
