//! In-process provider double for exercising the lifecycle without network calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use super::{
    Capabilities, PkceChallenge, PkceVerifier, Provider, ProviderKind, RefreshOutcome, TokenSet,
};
use crate::error::{
    upstream_error, validation_error, Error, UpstreamErrorKind, ValidationErrorKind,
};
use crate::webhook::{ProviderEvent, SignatureScheme};

/// How the fake responds to `refresh`.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeRefresh {
    Succeed,
    Reject { status: u16 },
    Timeout,
}

/// Provider double that counts calls.
pub struct FakeProvider {
    kind: ProviderKind,
    capabilities: Capabilities,
    redirect_uri: String,
    account_id: Option<String>,
    expires_in_seconds: i64,
    refresh_delay: Duration,
    refresh_behavior: Mutex<FakeRefresh>,
    fail_exchange: bool,
    signature_scheme: Option<SignatureScheme>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    last_verifier: Mutex<Option<String>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            capabilities: Capabilities {
                supports_pkce: true,
                supports_refresh: true,
                scopes_required: vec!["read".to_string()],
            },
            redirect_uri: format!("https://app.test/auth/{}/callback", kind),
            account_id: None,
            expires_in_seconds: 3600,
            refresh_delay: Duration::ZERO,
            refresh_behavior: Mutex::new(FakeRefresh::Succeed),
            fail_exchange: false,
            signature_scheme: None,
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            last_verifier: Mutex::new(None),
        }
    }

    pub fn without_pkce(mut self) -> Self {
        self.capabilities.supports_pkce = false;
        self
    }

    pub fn without_refresh(mut self) -> Self {
        self.capabilities.supports_refresh = false;
        self
    }

    pub fn with_account_id(mut self, account_id: &str) -> Self {
        self.account_id = Some(account_id.to_string());
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_refresh_behavior(self, behavior: FakeRefresh) -> Self {
        self.set_refresh_behavior(behavior);
        self
    }

    pub fn with_signature_scheme(mut self, scheme: SignatureScheme) -> Self {
        self.signature_scheme = Some(scheme);
        self
    }

    pub fn failing_exchange(mut self) -> Self {
        self.fail_exchange = true;
        self
    }

    pub fn set_refresh_behavior(&self, behavior: FakeRefresh) {
        if let Ok(mut current) = self.refresh_behavior.lock() {
            *current = behavior;
        }
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// The PKCE verifier sent with the most recent code exchange.
    pub fn last_verifier(&self) -> Option<String> {
        self.last_verifier.lock().ok().and_then(|v| v.clone())
    }

    fn issue(&self, owner_id: &str, access: String) -> TokenSet {
        TokenSet {
            provider: self.kind,
            owner_id: owner_id.to_string(),
            account_id: self.account_id.clone(),
            access_token: SecretString::new(access),
            refresh_token: Some(SecretString::new("fake-refresh".to_string())),
            obtained_at: Utc::now(),
            expires_in_seconds: self.expires_in_seconds,
            scope: self.capabilities.scopes_required.clone(),
        }
    }
}

#[derive(Deserialize)]
struct FakeWebhook {
    event: String,
    account_id: Option<String>,
}

#[async_trait]
impl Provider for FakeProvider {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        pkce_challenge: Option<&PkceChallenge>,
    ) -> Result<Url, Error> {
        let mut url = Url::parse("https://provider.test/authorize")?;
        url.query_pairs_mut()
            .append_pair("state", state)
            .append_pair("scope", &scopes.join(","));
        if let Some(challenge) = pkce_challenge {
            url.query_pairs_mut()
                .append_pair("code_challenge", challenge.as_str());
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        owner_id: &str,
        code: &str,
        _redirect_uri: &str,
        pkce_verifier: Option<&PkceVerifier>,
    ) -> Result<TokenSet, Error> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_verifier.lock() {
            *last = pkce_verifier.map(|v| v.expose().to_string());
        }
        if self.fail_exchange {
            return Err(upstream_error(
                UpstreamErrorKind::Rejected { status: 400 },
                "invalid_grant",
            ));
        }
        Ok(self.issue(owner_id, format!("access-for-{}", code)))
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<RefreshOutcome, Error> {
        if !self.capabilities.supports_refresh {
            return Ok(RefreshOutcome::ReauthorizationRequired);
        }

        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        let behavior = self
            .refresh_behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(FakeRefresh::Succeed);
        match behavior {
            FakeRefresh::Succeed => Ok(RefreshOutcome::Refreshed(
                self.issue(&tokens.owner_id, format!("refreshed-{}", call)),
            )),
            FakeRefresh::Reject { status } => Err(upstream_error(
                UpstreamErrorKind::Rejected { status },
                "refresh rejected",
            )),
            FakeRefresh::Timeout => Err(upstream_error(
                UpstreamErrorKind::Timeout,
                "refresh timed out",
            )),
        }
    }

    fn signature_scheme(&self) -> Option<SignatureScheme> {
        self.signature_scheme.clone()
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, Error> {
        let payload: FakeWebhook = serde_json::from_slice(body).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: crate::error::ErrorKind::Validation(ValidationErrorKind::MalformedPayload),
        })?;

        let account_id = payload.account_id.ok_or_else(|| {
            validation_error(ValidationErrorKind::MalformedPayload, "missing account_id")
        })?;

        Ok(match payload.event.as_str() {
            "deauthorize" => ProviderEvent::Deauthorization { account_id },
            "data_deletion" => ProviderEvent::DataDeletion { account_id },
            other => ProviderEvent::Ignored {
                event: other.to_string(),
            },
        })
    }
}
