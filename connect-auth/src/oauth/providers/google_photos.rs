//! Google Photos (Picker API) provider implementation.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{read_json, scopes_or_default, split_scopes, Issued};
use crate::error::{validation_error, Error, ValidationErrorKind};
use crate::oauth::{
    Capabilities, Endpoints, PkceChallenge, PkceVerifier, ProviderConfig, ProviderKind,
    RefreshOutcome, TokenSet, CHALLENGE_METHOD,
};

pub const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const API_BASE_URL: &str = "https://photospicker.googleapis.com";

pub const DEFAULT_SCOPES: &[&str] =
    &["https://www.googleapis.com/auth/photospicker.mediaitems.readonly"];

pub fn default_endpoints() -> Endpoints {
    Endpoints {
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        api_base_url: API_BASE_URL.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    grant_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TokenRefreshRequest<'a> {
    refresh_token: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
}

/// OAuth token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: String,
}

/// Google Photos OAuth provider.
///
/// Requests offline access so the first consent yields a refresh token. Google does not
/// rotate refresh tokens, and refresh responses omit it.
pub struct Provider {
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
    scopes: Vec<String>,
    endpoints: Endpoints,
    http_client: reqwest::Client,
}

impl Provider {
    /// Create a new Google Photos OAuth provider.
    pub fn new(config: ProviderConfig) -> Result<Self, Error> {
        let http_client = super::prepare(ProviderKind::GooglePhotos, &config)?;
        Ok(Self {
            scopes: scopes_or_default(&config.scopes, DEFAULT_SCOPES),
            client_id: config.client_id,
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
        ProviderKind::GooglePhotos
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
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("include_granted_scopes", "true")
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
                "Google code exchange requires a PKCE verifier",
            )
        })?;

        debug!("Exchanging Google Photos authorization code");

        let request = TokenExchangeRequest {
            code,
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            redirect_uri,
            grant_type: "authorization_code",
            code_verifier: Some(verifier.expose()),
        };
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&request)
            .send()
            .await?;
        let tokens: TokenResponse =
            read_json(ProviderKind::GooglePhotos, "code exchange", response).await?;

        info!("Exchanged Google Photos code for tokens");

        Ok(Issued {
            scope: split_scopes(&tokens.scope),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
            account_id: None,
        }
        .into_token_set(ProviderKind::GooglePhotos, owner_id, Utc::now()))
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<RefreshOutcome, Error> {
        let Some(refresh_token) = tokens.refresh_token.as_ref() else {
            return Ok(RefreshOutcome::ReauthorizationRequired);
        };

        debug!("Refreshing Google Photos access token");

        let request = TokenRefreshRequest {
            refresh_token: refresh_token.expose_secret(),
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            grant_type: "refresh_token",
        };
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&request)
            .send()
            .await?;
        let refreshed: TokenResponse =
            read_json(ProviderKind::GooglePhotos, "token refresh", response).await?;

        let scope = match split_scopes(&refreshed.scope) {
            scope if scope.is_empty() => tokens.scope.clone(),
            scope => scope,
        };

        Ok(RefreshOutcome::Refreshed(TokenSet {
            access_token: SecretString::new(refreshed.access_token),
            // Keep the existing refresh token unless a new one is issued
            refresh_token: refreshed
                .refresh_token
                .map(SecretString::new)
                .or_else(|| tokens.refresh_token.clone()),
            obtained_at: Utc::now(),
            expires_in_seconds: refreshed.expires_in,
            scope,
            ..tokens.clone()
        }))
    }
}
