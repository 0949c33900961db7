//! OAuth provider trait and types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use super::pkce::{PkceChallenge, PkceVerifier};
use super::token::TokenSet;
use crate::error::{validation_error, Error, ValidationErrorKind};
use crate::webhook::{ProviderEvent, SignatureScheme};

/// Third-party platforms a user can link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "instagram")]
    Instagram,
    #[serde(rename = "tiktok")]
    TikTok,
    #[serde(rename = "google_photos")]
    GooglePhotos,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Instagram,
        ProviderKind::TikTok,
        ProviderKind::GooglePhotos,
    ];

    /// Get the provider identifier string, as used in routes and storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Instagram => "instagram",
            ProviderKind::TikTok => "tiktok",
            ProviderKind::GooglePhotos => "google_photos",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| {
                validation_error(
                    ValidationErrorKind::UnknownProvider,
                    &format!("Unknown provider: {}", value),
                )
            })
    }
}

/// What a provider supports, so callers can branch without per-provider conditionals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_pkce: bool,
    pub supports_refresh: bool,
    pub scopes_required: Vec<String>,
}

/// Endpoints a provider adapter talks to. Overridable for tests and staging.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub authorize_url: String,
    pub token_url: String,
    /// Base URL for non-token API calls (e.g. Instagram's long-lived token exchange).
    pub api_base_url: String,
}

/// Explicit per-provider configuration, passed into each adapter at construction.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub endpoints: Endpoints,
    pub http_timeout: Duration,
}

/// Result of a refresh attempt that did not fail at the transport level.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// A replacement token set.
    Refreshed(TokenSet),
    /// The provider cannot refresh this token set; the user has to link again.
    ReauthorizationRequired,
}

/// Trait for OAuth 2.0 providers.
///
/// Implementations handle platform-specific OAuth flows including:
/// - Authorization URL generation with optional PKCE
/// - Authorization code exchange for tokens
/// - Token refresh, or reporting that re-authorization is required
/// - Parsing of verified webhook payloads
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider kind.
    fn provider(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// The redirect URI registered with the provider for this application.
    fn redirect_uri(&self) -> &str;

    /// Build the provider's authorization URL.
    ///
    /// # Arguments
    ///
    /// * `state` - CSRF state value
    /// * `scopes` - Scopes to request
    /// * `pkce_challenge` - Code challenge, only sent when the provider supports PKCE
    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        pkce_challenge: Option<&PkceChallenge>,
    ) -> Result<Url, Error>;

    /// Exchange an authorization code for a token set owned by `owner_id`.
    ///
    /// Codes are single-use: callers must not retry this on failure.
    async fn exchange_code(
        &self,
        owner_id: &str,
        code: &str,
        redirect_uri: &str,
        pkce_verifier: Option<&PkceVerifier>,
    ) -> Result<TokenSet, Error>;

    /// Refresh a token set.
    ///
    /// Providers without refresh support return `RefreshOutcome::ReauthorizationRequired`.
    async fn refresh(&self, tokens: &TokenSet) -> Result<RefreshOutcome, Error>;

    /// How this provider signs its webhooks, if it sends any.
    fn signature_scheme(&self) -> Option<SignatureScheme> {
        None
    }

    /// Interpret an already verified webhook body.
    fn parse_webhook(&self, _body: &[u8]) -> Result<ProviderEvent, Error> {
        Ok(ProviderEvent::Ignored {
            event: "unsupported".to_string(),
        })
    }
}
