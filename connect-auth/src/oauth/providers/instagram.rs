//! Instagram (Instagram API with Instagram Login) provider implementation.
//!
//! The authorization code yields a one-hour token that is immediately exchanged for a
//! long-lived (60 day) token. Long-lived tokens are refreshed in place; there is no separate
//! refresh token, and PKCE is not supported.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{read_json, scopes_or_default, split_scopes, Issued};
use crate::error::{
    upstream_error, validation_error, Error, UpstreamErrorKind, ValidationErrorKind,
};
use crate::oauth::{
    Capabilities, Endpoints, PkceChallenge, PkceVerifier, ProviderConfig, ProviderKind,
    RefreshOutcome, TokenSet,
};
use crate::webhook::{ProviderEvent, SignatureScheme};

pub const AUTHORIZE_URL: &str = "https://www.instagram.com/oauth/authorize";
pub const TOKEN_URL: &str = "https://api.instagram.com/oauth/access_token";
pub const API_BASE_URL: &str = "https://graph.instagram.com";

pub const DEFAULT_SCOPES: &[&str] = &[
    "instagram_business_basic",
    "instagram_business_content_publish",
    "instagram_business_manage_insights",
];

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Lifetime Instagram documents for long-lived tokens, used when a response omits it.
const LONG_LIVED_EXPIRES_IN: i64 = 60 * 24 * 60 * 60;

pub fn default_endpoints() -> Endpoints {
    Endpoints {
        authorize_url: AUTHORIZE_URL.to_string(),
        token_url: TOKEN_URL.to_string(),
        api_base_url: API_BASE_URL.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct CodeExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    redirect_uri: &'a str,
    code: &'a str,
}

/// Instagram returns the short-lived token either flat or wrapped in `data`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShortLivedResponse {
    Wrapped { data: Vec<ShortLivedToken> },
    Flat(ShortLivedToken),
}

#[derive(Debug, Deserialize)]
struct ShortLivedToken {
    access_token: String,
    user_id: AccountId,
    #[serde(default)]
    permissions: Option<Permissions>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AccountId {
    Text(String),
    Number(u64),
}

impl AccountId {
    fn into_string(self) -> String {
        match self {
            AccountId::Text(id) => id,
            AccountId::Number(id) => id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Permissions {
    List(Vec<String>),
    Joined(String),
}

impl Permissions {
    fn into_scopes(self) -> Vec<String> {
        match self {
            Permissions::List(list) => list,
            Permissions::Joined(joined) => split_scopes(&joined),
        }
    }
}

/// Long-lived token, from both the exchange and the refresh endpoint.
#[derive(Debug, Deserialize)]
struct LongLivedToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    user_id: AccountId,
    event: String,
}

/// Instagram OAuth provider.
pub struct Provider {
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
    scopes: Vec<String>,
    endpoints: Endpoints,
    http_client: reqwest::Client,
}

impl Provider {
    /// Create a new Instagram OAuth provider.
    pub fn new(config: ProviderConfig) -> Result<Self, Error> {
        let http_client = super::prepare(ProviderKind::Instagram, &config)?;
        Ok(Self {
            scopes: scopes_or_default(&config.scopes, DEFAULT_SCOPES),
            client_id: config.client_id,
            client_secret: config.client_secret,
            redirect_uri: config.redirect_uri,
            endpoints: config.endpoints,
            http_client,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.api_base_url.trim_end_matches('/'), path)
    }

    async fn exchange_for_long_lived(&self, short_lived: &str) -> Result<LongLivedToken, Error> {
        let response = self
            .http_client
            .get(self.api_url("access_token"))
            .query(&[
                ("grant_type", "ig_exchange_token"),
                ("client_secret", self.client_secret.expose_secret().as_str()),
                ("access_token", short_lived),
            ])
            .send()
            .await?;

        read_json(ProviderKind::Instagram, "long-lived token exchange", response).await
    }
}

#[async_trait]
impl crate::oauth::Provider for Provider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Instagram
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_pkce: false,
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
        _pkce_challenge: Option<&PkceChallenge>,
    ) -> Result<Url, Error> {
        let mut url = Url::parse(&self.endpoints.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(","))
            .append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        owner_id: &str,
        code: &str,
        redirect_uri: &str,
        _pkce_verifier: Option<&PkceVerifier>,
    ) -> Result<TokenSet, Error> {
        debug!("Exchanging Instagram authorization code");

        let request = CodeExchangeRequest {
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            grant_type: "authorization_code",
            redirect_uri,
            code,
        };
        let response = self
            .http_client
            .post(&self.endpoints.token_url)
            .form(&request)
            .send()
            .await?;

        let short_lived = match read_json(ProviderKind::Instagram, "code exchange", response).await? {
            ShortLivedResponse::Flat(token) => token,
            ShortLivedResponse::Wrapped { data } => data.into_iter().next().ok_or_else(|| {
                upstream_error(
                    UpstreamErrorKind::InvalidResponse,
                    "Instagram returned an empty token list",
                )
            })?,
        };

        let long_lived = self
            .exchange_for_long_lived(&short_lived.access_token)
            .await?;
        let obtained_at = Utc::now();

        info!("Exchanged Instagram code for a long-lived token");

        Ok(Issued {
            access_token: long_lived.access_token,
            refresh_token: None,
            expires_in: long_lived.expires_in.unwrap_or(LONG_LIVED_EXPIRES_IN),
            scope: short_lived
                .permissions
                .map(Permissions::into_scopes)
                .unwrap_or_else(|| self.scopes.clone()),
            account_id: Some(short_lived.user_id.into_string()),
        }
        .into_token_set(ProviderKind::Instagram, owner_id, obtained_at))
    }

    async fn refresh(&self, tokens: &TokenSet) -> Result<RefreshOutcome, Error> {
        debug!("Refreshing Instagram long-lived token");

        let response = self
            .http_client
            .get(self.api_url("refresh_access_token"))
            .query(&[
                ("grant_type", "ig_refresh_token"),
                ("access_token", tokens.access_token.expose_secret().as_str()),
            ])
            .send()
            .await?;
        let refreshed: LongLivedToken =
            read_json(ProviderKind::Instagram, "token refresh", response).await?;

        Ok(RefreshOutcome::Refreshed(TokenSet {
            access_token: SecretString::new(refreshed.access_token),
            obtained_at: Utc::now(),
            expires_in_seconds: refreshed.expires_in.unwrap_or(LONG_LIVED_EXPIRES_IN),
            ..tokens.clone()
        }))
    }

    fn signature_scheme(&self) -> Option<SignatureScheme> {
        Some(SignatureScheme::PrefixedHex {
            header: SIGNATURE_HEADER,
            prefix: "sha256=",
        })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, Error> {
        let payload: WebhookPayload = serde_json::from_slice(body).map_err(|_| {
            validation_error(
                ValidationErrorKind::MalformedPayload,
                "Instagram webhook is not a {user_id, event} object",
            )
        })?;

        let account_id = payload.user_id.into_string();
        Ok(match payload.event.as_str() {
            "deauthorize" => ProviderEvent::Deauthorization { account_id },
            "data_deletion" => ProviderEvent::DataDeletion { account_id },
            _ => ProviderEvent::Ignored {
                event: payload.event,
            },
        })
    }
}
