//! TikTok Login Kit (v2) provider implementation.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{read_json, scopes_or_default, split_scopes, Issued};
use crate::error::{
    upstream_error, validation_error, Error, UpstreamErrorKind, ValidationErrorKind,
};
use crate::oauth::{
    Capabilities, Endpoints, PkceChallenge, PkceVerifier, ProviderConfig, ProviderKind,
    RefreshOutcome, TokenSet, CHALLENGE_METHOD,
};
use crate::webhook::{ProviderEvent, SignatureScheme, DEFAULT_TIMESTAMP_TOLERANCE_SECONDS};

pub const AUTHORIZE_URL: &str = "https://www.tiktok.com/v2/auth/authorize/";
pub const TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
pub const API_BASE_URL: &str = "https://open.tiktokapis.com";

pub const DEFAULT_SCOPES: &[&str] = &["user.info.basic", "video.list"];

pub const SIGNATURE_HEADER: &str = "TikTok-Signature";

const DEAUTHORIZATION_EVENT: &str = "authorization.removed";

pub fn default_endpoints() -> Endpoints {
    Endpoints {
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        api_base_url: API_BASE_URL.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct CodeExchangeRequest<'a> {
    client_key: &'a str,
    client_secret: &'a str,
    code: &'a str,
    grant_type: &'static str,
    redirect_uri: &'a str,
    code_verifier: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenRefreshRequest<'a> {
    client_key: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

/// TikTok reports grant errors in the body, sometimes with a 200 status.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    open_id: Option<String>,
    refresh_token: Option<String>,
    #[serde(default)]
    scope: String,
    error: Option<String>,
}

impl TokenResponse {
    fn into_issued(self, operation: &str) -> Result<Issued, Error> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            warn!("TikTok {} rejected: {}", operation, error);
            return Err(upstream_error(
                UpstreamErrorKind::Rejected { status: 400 },
                &format!("TikTok {} rejected: {}", operation, error),
            ));
        }

        match (self.access_token, self.expires_in) {
            (Some(access_token), Some(expires_in)) => Ok(Issued {
                access_token,
                refresh_token: self.refresh_token,
                expires_in,
                scope: split_scopes(&self.scope),
                account_id: self.open_id,
            }),
            _ => Err(upstream_error(
                UpstreamErrorKind::InvalidResponse,
                &format!("TikTok {} response has no access token", operation),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: String,
    #[serde(default)]
    user_openid: Option<String>,
}

/// TikTok OAuth provider.
///
/// Refresh tokens rotate: every refresh returns a new one and invalidates the previous.
pub struct Provider {
    client_key: String,
    client_secret: SecretString,
    redirect_uri: String,
    scopes: Vec<String>,
    endpoints: Endpoints,
    http_client: reqwest::Client,
}

impl Provider {
    /// Create a new TikTok OAuth provider. `config.client_id` is TikTok's client key.
    pub fn new(config: ProviderConfig) -> Result<Self, Error> {
        let http_client = super::prepare(ProviderKind::TikTok, &config)?;
        Ok(Self {
            scopes: scopes_or_default(&config.scopes, DEFAULT_SCOPES),
            client_key: config.client_id,
            client_secret: config.client_secret,
            redirect_uri: config.redirect_uri,
            endpoints: config.endpoints,
            http_client,
        })
    }
}

#[async_trait]
impl crate::oauth::Provider for Provider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::TikTok
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_pkce: true,
            supports_refresh: true,
            scopes_required: self.scopes.clone(),
        }
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
        let mut url = Url::parse(&self.endpoints.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("client_key", &self.client_key)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(","))
            .append_pair("state", state);
        if let Some(challenge) = pkce_challenge {
            url.query_pairs_mut()
                .append_pair("code_challenge", challenge.as_str())
                .append_pair("code_challenge_method", CHALLENGE_METHOD);
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        owner_id: &str,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&PkceVerifier>,
    ) -> Result<TokenSet, Error> {
        let verifier = pkce_verifier.ok_or_else(|| {
            validation_error(
                ValidationErrorKind::MissingPkceVerifier,
                "TikTok code exchange requires a PKCE verifier",
            )
        })?;

        debug!("Exchanging TikTok authorization code");

        let request = CodeExchangeRequest {
            client_key: &self.client_key,
            client_secret: self.client_secret.expose_secret(),
            code,
            grant_type: "authorization_code",
            redirect_uri,
            code_verifier: verifier.expose(),
        };
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&request)
            .send()
            .await?;

        let issued = read_json::<TokenResponse>(ProviderKind::TikTok, "code exchange", response)
            .await?
            .into_issued("code exchange")?;

        info!("Exchanged TikTok code for tokens");
        Ok(issued.into_token_set(ProviderKind::TikTok, owner_id, Utc::now()))
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<RefreshOutcome, Error> {
        let Some(refresh_token) = tokens.refresh_token.as_ref() else {
            return Ok(RefreshOutcome::ReauthorizationRequired);
        };

        debug!("Refreshing TikTok access token");

        let request = TokenRefreshRequest {
            client_key: &self.client_key,
            client_secret: self.client_secret.expose_secret(),
            grant_type: "refresh_token",
            refresh_token: refresh_token.expose_secret(),
        };
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&request)
            .send()
            .await?;

        let mut issued = read_json::<TokenResponse>(ProviderKind::TikTok, "token refresh", response)
            .await?
            .into_issued("token refresh")?;
        if issued.account_id.is_none() {
            issued.account_id = tokens.account_id.clone();
        }
        if issued.scope.is_empty() {
            issued.scope = tokens.scope.clone();
        }

        Ok(RefreshOutcome::Refreshed(issued.into_token_set(
            ProviderKind::TikTok,
            &tokens.owner_id,
            Utc::now(),
        )))
    }

    fn signature_scheme(&self) -> Option<SignatureScheme> {
        Some(SignatureScheme::Timestamped {
            header: SIGNATURE_HEADER,
            tolerance_seconds: DEFAULT_TIMESTAMP_TOLERANCE_SECONDS,
        })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, Error> {
        let payload: WebhookPayload = serde_json::from_slice(body).map_err(|_| {
            validation_error(
                ValidationErrorKind::MalformedPayload,
                "TikTok webhook is not an event object",
            )
        })?;

        if payload.event != DEAUTHORIZATION_EVENT {
            return Ok(ProviderEvent::Ignored {
                event: payload.event,
            });
        }

        let account_id = payload.user_openid.filter(|id| !id.is_empty()).ok_or_else(|| {
            validation_error(
                ValidationErrorKind::MalformedPayload,
                "authorization.removed event has no user_openid",
            )
        })?;
        Ok(ProviderEvent::Deauthorization { account_id })
    }
}
