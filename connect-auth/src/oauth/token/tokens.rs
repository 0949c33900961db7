//! OAuth token types.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use crate::oauth::ProviderKind;

/// Credentials a provider issued for one application user.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub provider: ProviderKind,
    /// The application user the tokens belong to.
    pub owner_id: String,
    /// The provider-side account id (Instagram `user_id`, TikTok `open_id`), used to route
    /// provider-initiated webhooks back to the owner.
    pub account_id: Option<String>,
    /// Access token for API requests.
    pub access_token: SecretString,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: Option<SecretString>,
    pub obtained_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
    /// Granted scopes.
    pub scope: Vec<String>,
}

impl TokenSet {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.obtained_at + Duration::seconds(self.expires_in_seconds)
    }

    /// Check if the access token is expired or will expire within `safety_margin` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        now >= self.expires_at() - safety_margin
    }
}

/// Link lifecycle of one (user, provider) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Unlinked,
    LinkPending,
    Linked,
    Refreshing,
    Expired,
}

/// Secret-free view of a link, safe to log and return to clients.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LinkStatus {
    pub provider: ProviderKind,
    pub owner_id: String,
    pub state: LinkState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LinkStatus {
    pub fn new(owner_id: &str, provider: ProviderKind, state: LinkState) -> Self {
        Self {
            provider,
            owner_id: owner_id.to_string(),
            state,
            account_id: None,
            scope: vec![],
            expires_at: None,
        }
    }

    pub fn from_tokens(tokens: &TokenSet, state: LinkState) -> Self {
        Self {
            provider: tokens.provider,
            owner_id: tokens.owner_id.clone(),
            state,
            account_id: tokens.account_id.clone(),
            scope: tokens.scope.clone(),
            expires_at: Some(tokens.expires_at()),
        }
    }
}
