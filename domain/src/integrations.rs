//! Link orchestration for the HTTP layer: starting and finishing provider links, link status,
//! webhook handling and data-deletion lookups.

use std::sync::Arc;

use chrono::Duration;
use connect_auth::oauth::token::{
    AuthorizationRequest, LinkStatus, Manager, MemoryStorage, Storage, TokenAccess,
};
use connect_auth::oauth::{MemoryStateBackend, ProviderKind, Registry, StateBackend, StateManager};
use connect_auth::webhook::{WebhookEvent, WebhookVerifier};
use log::*;
use service::config::Config;
use url::Url;

use crate::data_deletion::{DeletionQueue, DeletionRequest, MemoryDeletionQueue};
use crate::error::{
    domain_error, DomainErrorKind, Error, ExternalErrorKind, InternalErrorKind, InvalidErrorKind,
};
use crate::providers;
use crate::webhook::{self, WebhookAck};

/// Parse a `{provider}` route segment. Unknown providers are `NotFound`.
pub fn parse_provider(segment: &str) -> Result<ProviderKind, Error> {
    Ok(segment.parse::<ProviderKind>()?)
}

/// Why a connect attempt failed, as reported to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Denied,
    InvalidState,
    ExchangeFailed,
    ProviderUnavailable,
    Configuration,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Denied => "denied",
            FailureReason::InvalidState => "invalid_state",
            FailureReason::ExchangeFailed => "exchange_failed",
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::Configuration => "configuration",
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match &err.error_kind {
            DomainErrorKind::Internal(InternalErrorKind::Invalid(_)) => FailureReason::InvalidState,
            DomainErrorKind::Internal(InternalErrorKind::Config) => FailureReason::Configuration,
            DomainErrorKind::Internal(_) => FailureReason::ExchangeFailed,
            DomainErrorKind::External(ExternalErrorKind::Rejected { status }) if *status < 500 => {
                FailureReason::ExchangeFailed
            }
            DomainErrorKind::External(_) => FailureReason::ProviderUnavailable,
        }
    }
}

/// Final outcome of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(FailureReason),
}

fn seconds(value: u64, name: &str) -> Result<Duration, Error> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            domain_error(
                DomainErrorKind::Internal(InternalErrorKind::Config),
                &format!("{} is out of range", name),
            )
        })
}

fn require_user(user_id: &str) -> Result<(), Error> {
    if user_id.trim().is_empty() {
        return Err(domain_error(
            DomainErrorKind::Internal(InternalErrorKind::Invalid(InvalidErrorKind::Request)),
            "user_id is required",
        ));
    }
    Ok(())
}

/// Everything the HTTP layer needs to link accounts and receive provider webhooks.
pub struct Integrations {
    manager: Manager<Arc<dyn Storage>>,
    verifier: WebhookVerifier,
    deletions: Arc<dyn DeletionQueue>,
    integrations_url: Url,
    deletion_status_url: Url,
    deletion_sla: Duration,
}

impl Integrations {
    /// Build from configuration with in-memory token, state and deletion stores.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_backends(
            config,
            providers::registry(config)?,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStateBackend::new()),
            Arc::new(MemoryDeletionQueue::new()),
        )
    }

    pub fn with_backends(
        config: &Config,
        registry: Registry,
        storage: Arc<dyn Storage>,
        state_backend: Arc<dyn StateBackend>,
        deletions: Arc<dyn DeletionQueue>,
    ) -> Result<Self, Error> {
        let registry = Arc::new(registry);
        let verifier = providers::webhook_verifier(config, registry.clone())?;

        let states = StateManager::with_ttl(
            state_backend,
            seconds(config.oauth_state_ttl_seconds, "oauth_state_ttl_seconds")?,
        );
        let manager = Manager::new(storage, registry, states).with_refresh_margin(seconds(
            config.token_refresh_margin_seconds,
            "token_refresh_margin_seconds",
        )?);

        let app_base_url = config.app_base_url();
        Ok(Self {
            manager,
            verifier,
            deletions,
            integrations_url: Url::parse(&format!("{}/settings/integrations", app_base_url))?,
            deletion_status_url: Url::parse(&format!("{}/data-deletion", app_base_url))?,
            deletion_sla: Duration::days(i64::from(config.data_deletion_sla_days)),
        })
    }

    /// Lifetime of a state value, and so of the cookie carrying it.
    pub fn state_ttl(&self) -> Duration {
        self.manager.state_manager().ttl()
    }

    /// Begin linking `provider` for `user_id`; returns where to send the browser.
    pub async fn start_link(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<AuthorizationRequest, Error> {
        require_user(user_id)?;
        Ok(self.manager.start_link(user_id, provider).await?)
    }

    /// Finish linking from the provider callback. The linked user comes from the state record.
    pub async fn complete_link(
        &self,
        provider: ProviderKind,
        code: &str,
        state: &str,
    ) -> Result<LinkStatus, Error> {
        Ok(self.manager.complete_link(provider, code, state).await?)
    }

    /// The user declined consent on the provider side; burn the state value.
    pub async fn decline_link(&self, provider: ProviderKind, state: &str) -> Result<(), Error> {
        Ok(self.manager.decline_link(provider, state).await?)
    }

    /// Frontend URL reporting the outcome of a connect attempt.
    pub fn app_redirect(&self, provider: ProviderKind, outcome: ConnectOutcome) -> String {
        let mut url = self.integrations_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", provider.as_str());
            match outcome {
                ConnectOutcome::Connected => {
                    query.append_pair("status", "connected");
                }
                ConnectOutcome::Failed(reason) => {
                    query
                        .append_pair("status", "error")
                        .append_pair("reason", reason.as_str());
                }
            }
        }
        url.to_string()
    }

    pub async fn status(&self, user_id: &str, provider: ProviderKind) -> Result<LinkStatus, Error> {
        require_user(user_id)?;
        Ok(self.manager.status(user_id, provider).await?)
    }

    pub async fn unlink(&self, user_id: &str, provider: ProviderKind) -> Result<(), Error> {
        require_user(user_id)?;
        Ok(self.manager.unlink(user_id, provider).await?)
    }

    /// A usable access token for calling the provider on the user's behalf.
    pub async fn ensure_fresh_token(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<TokenAccess, Error> {
        require_user(user_id)?;
        Ok(self.manager.ensure_fresh_token(user_id, provider).await?)
    }

    /// Whether webhooks from `provider` can be verified.
    pub fn accepts_webhooks(&self, provider: ProviderKind) -> bool {
        self.verifier.accepts(provider)
    }

    /// Header carrying the provider's webhook signature.
    pub fn signature_header(&self, provider: ProviderKind) -> Option<&'static str> {
        self.verifier.signature_header(provider)
    }

    /// Verify a raw webhook body and, only if it passes, act on it.
    pub async fn handle_webhook(
        &self,
        provider: ProviderKind,
        raw_body: Vec<u8>,
        signature_header: Option<String>,
    ) -> Result<WebhookAck, Error> {
        if !self.accepts_webhooks(provider) {
            return Err(domain_error(
                DomainErrorKind::Internal(InternalErrorKind::NotFound),
                &format!("{} webhooks are not accepted", provider),
            ));
        }

        let mut event = WebhookEvent::new(provider, raw_body, signature_header);
        let parsed = self.verifier.authenticate(&mut event)?;

        webhook::dispatch(
            &self.manager,
            self.deletions.as_ref(),
            &self.deletion_status_url,
            self.deletion_sla,
            provider,
            parsed,
        )
        .await
    }

    /// Look up a data-deletion request by its confirmation code.
    pub async fn deletion_status(&self, confirmation_code: &str) -> Result<DeletionRequest, Error> {
        self.deletions
            .get(confirmation_code)
            .await?
            .ok_or_else(|| {
                domain_error(
                    DomainErrorKind::Internal(InternalErrorKind::NotFound),
                    "Unknown confirmation code",
                )
            })
    }

    /// Drop expired state records. Expired values are unusable whether or not they are purged.
    pub async fn purge_expired_states(&self) -> Result<usize, Error> {
        let purged = self.manager.state_manager().purge_expired().await?;
        if purged > 0 {
            debug!("Purged {} expired OAuth states", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, sign, FakeProvider, SCHEME};
    use crate::DeletionStatus;
    use connect_auth::oauth::token::LinkState;
    use connect_auth::webhook::HmacWebhookValidator;
    use secrecy::{ExposeSecret, SecretString};

    const WEBHOOK_ARGS: &[&str] = &[
        "--app-base-url",
        "https://app.example.com",
        "--instagram-webhook-secret",
        "S",
    ];

    fn integrations() -> Integrations {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(
                FakeProvider::new(ProviderKind::Instagram)
                    .without_pkce()
                    .with_account_id("17841")
                    .with_signature_scheme(SCHEME),
            ))
            .register(Arc::new(FakeProvider::new(ProviderKind::TikTok)));

        Integrations::with_backends(
            &config(WEBHOOK_ARGS),
            registry,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStateBackend::new()),
            Arc::new(MemoryDeletionQueue::new()),
        )
        .unwrap()
    }

    async fn link(integrations: &Integrations, user_id: &str, provider: ProviderKind) {
        let request = integrations.start_link(user_id, provider).await.unwrap();
        integrations
            .complete_link(provider, "code", &request.state.value)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_flow() {
        let integrations = integrations();

        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        assert_eq!(
            integrations
                .status("42", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::LinkPending
        );

        let status = integrations
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap();
        assert_eq!(status.owner_id, "42");
        assert_eq!(status.state, LinkState::Linked);

        let access = integrations
            .ensure_fresh_token("42", ProviderKind::TikTok)
            .await
            .unwrap();
        assert_eq!(
            access.access_token().map(|t| t.expose_secret().as_str()),
            Some("access-for-code")
        );
    }

    #[tokio::test]
    async fn test_replayed_state_is_invalid() {
        let integrations = integrations();
        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        integrations
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap();

        let err = integrations
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Invalid(InvalidErrorKind::State))
        );
        assert_eq!(FailureReason::from_error(&err), FailureReason::InvalidState);
    }

    #[tokio::test]
    async fn test_start_link_requires_user() {
        let integrations = integrations();
        let err = integrations
            .start_link("  ", ProviderKind::TikTok)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Invalid(InvalidErrorKind::Request))
        );
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_configuration_error() {
        let integrations = integrations();
        let err = integrations
            .start_link("42", ProviderKind::GooglePhotos)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Config)
        );
    }

    #[tokio::test]
    async fn test_decline_link_burns_state() {
        let integrations = integrations();
        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();

        integrations
            .decline_link(ProviderKind::TikTok, &request.state.value)
            .await
            .unwrap();

        assert_eq!(
            integrations
                .status("42", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
        assert!(integrations
            .complete_link(ProviderKind::TikTok, "code", &request.state.value)
            .await
            .is_err());
    }

    #[test]
    fn test_app_redirect() {
        let integrations = integrations();
        assert_eq!(
            integrations.app_redirect(ProviderKind::TikTok, ConnectOutcome::Connected),
            "https://app.example.com/settings/integrations?provider=tiktok&status=connected"
        );
        assert_eq!(
            integrations.app_redirect(
                ProviderKind::GooglePhotos,
                ConnectOutcome::Failed(FailureReason::Denied)
            ),
            "https://app.example.com/settings/integrations?provider=google_photos&status=error&reason=denied"
        );
    }

    #[test]
    fn test_failure_reason_from_error() {
        let upstream = |kind| Error {
            source: None,
            error_kind: DomainErrorKind::External(kind),
        };
        assert_eq!(
            FailureReason::from_error(&upstream(ExternalErrorKind::Rejected { status: 400 })),
            FailureReason::ExchangeFailed
        );
        assert_eq!(
            FailureReason::from_error(&upstream(ExternalErrorKind::Rejected { status: 503 })),
            FailureReason::ProviderUnavailable
        );
        assert_eq!(
            FailureReason::from_error(&upstream(ExternalErrorKind::Timeout)),
            FailureReason::ProviderUnavailable
        );
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(parse_provider("tiktok").unwrap(), ProviderKind::TikTok);
        assert_eq!(
            parse_provider("myspace").unwrap_err().error_kind,
            DomainErrorKind::Internal(InternalErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_deauthorization_webhook_unlinks() {
        let integrations = integrations();
        link(&integrations, "42", ProviderKind::Instagram).await;

        let body = br#"{"event":"deauthorize","account_id":"17841"}"#.to_vec();
        let header = sign("S", &body);
        let ack = integrations
            .handle_webhook(ProviderKind::Instagram, body, Some(header))
            .await
            .unwrap();

        assert_eq!(ack, WebhookAck::Acknowledged);
        assert_eq!(
            integrations
                .status("42", ProviderKind::Instagram)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
    }

    #[tokio::test]
    async fn test_deauthorization_for_unknown_account_is_acknowledged() {
        let integrations = integrations();
        let body = br#"{"event":"deauthorize","account_id":"nobody"}"#.to_vec();
        let header = sign("S", &body);

        let ack = integrations
            .handle_webhook(ProviderKind::Instagram, body, Some(header))
            .await
            .unwrap();
        assert_eq!(ack, WebhookAck::Acknowledged);
    }

    #[tokio::test]
    async fn test_forged_webhook_changes_nothing() {
        let integrations = integrations();
        link(&integrations, "42", ProviderKind::Instagram).await;

        let body = br#"{"event":"deauthorize","account_id":"17841"}"#.to_vec();
        let header = sign("S-prime", &body);
        let err = integrations
            .handle_webhook(ProviderKind::Instagram, body, Some(header))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Unauthenticated)
        );
        assert_eq!(
            integrations
                .status("42", ProviderKind::Instagram)
                .await
                .unwrap()
                .state,
            LinkState::Linked
        );
    }

    #[tokio::test]
    async fn test_webhook_without_secret_is_not_found() {
        let integrations = integrations();
        assert!(!integrations.accepts_webhooks(ProviderKind::TikTok));

        let err = integrations
            .handle_webhook(ProviderKind::TikTok, b"{}".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_data_deletion_webhook_queues_work() {
        let integrations = integrations();
        link(&integrations, "42", ProviderKind::Instagram).await;

        let body = br#"{"event":"data_deletion","account_id":"17841"}"#.to_vec();
        let header = sign("S", &body);
        let ack = integrations
            .handle_webhook(ProviderKind::Instagram, body.clone(), Some(header.clone()))
            .await
            .unwrap();

        let WebhookAck::DataDeletion(receipt) = ack else {
            panic!("expected a deletion receipt, got {:?}", ack);
        };
        assert_eq!(
            receipt.url,
            format!(
                "https://app.example.com/data-deletion?code={}",
                receipt.confirmation_code
            )
        );

        let request = integrations
            .deletion_status(&receipt.confirmation_code)
            .await
            .unwrap();
        assert_eq!(request.status, DeletionStatus::Pending);
        assert_eq!(request.owner_ids, vec!["42".to_string()]);
        assert_eq!(request.due_by - request.requested_at, Duration::days(30));

        // A re-sent request gets the same confirmation code.
        let again = integrations
            .handle_webhook(ProviderKind::Instagram, body, Some(header))
            .await
            .unwrap();
        assert_eq!(again, WebhookAck::DataDeletion(receipt));
    }

    #[tokio::test]
    async fn test_unknown_deletion_code() {
        let integrations = integrations();
        let err = integrations.deletion_status("nope").await.unwrap_err();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_tiktok_link_against_token_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"act.1","expires_in":86400,"open_id":"open-42",
                    "refresh_expires_in":31536000,"refresh_token":"rft.1",
                    "scope":"user.info.basic,video.list","token_type":"Bearer"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let token_url = format!("{}/token", server.url());
        let integrations = Integrations::new(&config(&[
            "--tiktok-client-id",
            "client-123",
            "--tiktok-client-secret",
            "secret",
            "--tiktok-token-url",
            &token_url,
        ]))
        .unwrap();

        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        assert!(request
            .url
            .as_str()
            .starts_with(connect_auth::oauth::providers::tiktok::AUTHORIZE_URL));

        let status = integrations
            .complete_link(ProviderKind::TikTok, "abc", &request.state.value)
            .await
            .unwrap();
        assert_eq!(status.account_id.as_deref(), Some("open-42"));
        assert_eq!(status.scope, vec!["user.info.basic", "video.list"]);
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_tiktok_deauthorization_webhook_unlinks() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"act.1","expires_in":86400,"open_id":"open-42",
                    "refresh_expires_in":31536000,"refresh_token":"rft.1",
                    "scope":"user.info.basic","token_type":"Bearer"}"#,
            )
            .create_async()
            .await;

        let token_url = format!("{}/token", server.url());
        let integrations = Integrations::new(&config(&[
            "--tiktok-client-id",
            "client-123",
            "--tiktok-client-secret",
            "secret",
            "--tiktok-webhook-secret",
            "tt-secret",
            "--tiktok-token-url",
            &token_url,
        ]))
        .unwrap();

        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        integrations
            .complete_link(ProviderKind::TikTok, "abc", &request.state.value)
            .await
            .unwrap();
        assert_eq!(
            integrations
                .status("42", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::Linked
        );

        let body = br#"{"client_key":"client-123","event":"authorization.removed",
            "create_time":1615338610,"user_openid":"open-42","content":"{\"reason\":1}"}"#
            .to_vec();
        let scheme = integrations
            .manager
            .registry()
            .get(ProviderKind::TikTok)
            .unwrap()
            .signature_scheme()
            .unwrap();
        let header = HmacWebhookValidator::new(
            ProviderKind::TikTok,
            SecretString::new("tt-secret".to_string()),
            scheme,
        )
        .sign(&body, chrono::Utc::now().timestamp())
        .unwrap();
        assert!(header.starts_with("t="));
        assert_eq!(
            integrations.signature_header(ProviderKind::TikTok),
            Some("TikTok-Signature")
        );

        let ack = integrations
            .handle_webhook(ProviderKind::TikTok, body, Some(header))
            .await
            .unwrap();

        assert_eq!(ack, WebhookAck::Acknowledged);
        assert_eq!(
            integrations
                .status("42", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
    }

    #[tokio::test]
    async fn test_rejected_exchange_reports_exchange_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let token_url = format!("{}/token", server.url());
        let integrations = Integrations::new(&config(&[
            "--tiktok-client-id",
            "client-123",
            "--tiktok-client-secret",
            "secret",
            "--tiktok-token-url",
            &token_url,
        ]))
        .unwrap();

        let request = integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        let err = integrations
            .complete_link(ProviderKind::TikTok, "abc", &request.state.value)
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            DomainErrorKind::External(ExternalErrorKind::Rejected { status: 400 })
        );
        assert_eq!(FailureReason::from_error(&err), FailureReason::ExchangeFailed);
        assert_eq!(
            integrations
                .status("42", ProviderKind::TikTok)
                .await
                .unwrap()
                .state,
            LinkState::Unlinked
        );
    }

    #[tokio::test]
    async fn test_purge_expired_states() {
        let integrations = integrations();
        integrations
            .start_link("42", ProviderKind::TikTok)
            .await
            .unwrap();
        assert_eq!(integrations.purge_expired_states().await.unwrap(), 0);
    }
}
