//! OAuth provider implementations.
//!
//! Each adapter takes an explicit `ProviderConfig` at construction; nothing is read from
//! process-wide state.

pub mod google_photos;
pub mod instagram;
pub mod tiktok;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{Provider, ProviderConfig, ProviderKind, TokenSet};
use crate::error::{
    configuration_error, upstream_error, ConfigurationErrorKind, Error, UpstreamErrorKind,
};
use crate::http::HttpClientBuilder;

/// Build the adapter for `kind` from its configuration.
pub fn build(kind: ProviderKind, config: ProviderConfig) -> Result<Arc<dyn Provider>, Error> {
    Ok(match kind {
        ProviderKind::Instagram => Arc::new(instagram::Provider::new(config)?),
        ProviderKind::TikTok => Arc::new(tiktok::Provider::new(config)?),
        ProviderKind::GooglePhotos => Arc::new(google_photos::Provider::new(config)?),
    })
}

/// Check credentials and endpoints, and build the adapter's HTTP client.
pub(crate) fn prepare(kind: ProviderKind, config: &ProviderConfig) -> Result<reqwest::Client, Error> {
    if config.client_id.trim().is_empty() || config.client_secret.expose_secret().trim().is_empty()
    {
        return Err(configuration_error(
            ConfigurationErrorKind::MissingCredentials,
            &format!("{} client id and secret are required", kind),
        ));
    }

    for url in [
        &config.endpoints.authorize_url,
        &config.endpoints.token_url,
        &config.endpoints.api_base_url,
        &config.redirect_uri,
    ] {
        url::Url::parse(url)?;
    }

    Ok(HttpClientBuilder::new()
        .with_timeout(config.http_timeout)
        .build()?)
}

/// Read a provider response, turning any non-2xx status into `UpstreamErrorKind::Rejected`.
///
/// Error bodies are logged at debug level only; providers may echo request parameters.
pub(crate) async fn read_json<T: DeserializeOwned>(
    kind: ProviderKind,
    operation: &str,
    response: reqwest::Response,
) -> Result<T, Error> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("{} {} failed with status {}", kind, operation, status);
        tracing::debug!("{} error body: {}", kind, truncate(&body, 512));
        return Err(upstream_error(
            UpstreamErrorKind::Rejected {
                status: status.as_u16(),
            },
            &format!("{} {} returned {}", kind, operation, status),
        ));
    }

    response.json::<T>().await.map_err(|e| {
        warn!("Failed to parse {} {} response", kind, operation);
        Error {
            source: Some(Box::new(e.without_url())),
            error_kind: crate::error::ErrorKind::Upstream(UpstreamErrorKind::InvalidResponse),
        }
    })
}

/// Requested scopes, falling back to the provider defaults when none are configured.
pub(crate) fn scopes_or_default(configured: &[String], defaults: &[&str]) -> Vec<String> {
    if configured.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        configured.to_vec()
    }
}

pub(crate) fn split_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ' ')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fields every adapter fills in when it turns a token response into a `TokenSet`.
pub(crate) struct Issued {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Vec<String>,
    pub account_id: Option<String>,
}

impl Issued {
    pub(crate) fn into_token_set(
        self,
        provider: ProviderKind,
        owner_id: &str,
        obtained_at: DateTime<Utc>,
    ) -> TokenSet {
        TokenSet {
            provider,
            owner_id: owner_id.to_string(),
            account_id: self.account_id,
            access_token: SecretString::new(self.access_token),
            refresh_token: self.refresh_token.map(SecretString::new),
            obtained_at,
            expires_in_seconds: self.expires_in,
            scope: self.scope,
        }
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
