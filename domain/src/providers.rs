//! Builds the provider registry and webhook verifier from process configuration.
//!
//! Providers without a client id and secret are left out of the registry; using one later is a
//! configuration error.

use std::sync::Arc;
use std::time::Duration;

use connect_auth::oauth::providers::{self, google_photos, instagram, tiktok};
use connect_auth::oauth::{Endpoints, ProviderConfig, ProviderKind, Registry};
use connect_auth::webhook::WebhookVerifier;
use log::*;
use secrecy::SecretString;
use service::config::{Config, ProviderSettings};

use crate::error::Error;

/// Configured settings for one provider.
pub fn settings(config: &Config, kind: ProviderKind) -> ProviderSettings {
    match kind {
        ProviderKind::Instagram => config.instagram(),
        ProviderKind::TikTok => config.tiktok(),
        ProviderKind::GooglePhotos => config.google_photos(),
    }
}

fn default_endpoints(kind: ProviderKind) -> Endpoints {
    match kind {
        ProviderKind::Instagram => instagram::default_endpoints(),
        ProviderKind::TikTok => tiktok::default_endpoints(),
        ProviderKind::GooglePhotos => google_photos::default_endpoints(),
    }
}

/// Adapter configuration for `kind`, or `None` when its credentials are absent.
pub fn provider_config(config: &Config, kind: ProviderKind) -> Option<ProviderConfig> {
    let settings = settings(config, kind);
    if !settings.has_credentials() {
        return None;
    }

    let defaults = default_endpoints(kind);
    let endpoints = Endpoints {
        authorize_url: settings.auth_url.unwrap_or(defaults.authorize_url),
        token_url: settings.token_url.unwrap_or(defaults.token_url),
        api_base_url: settings.api_base_url.unwrap_or(defaults.api_base_url),
    };

    Some(ProviderConfig {
        client_id: settings.client_id.unwrap_or_default(),
        client_secret: SecretString::new(settings.client_secret.unwrap_or_default()),
        redirect_uri: config.oauth_redirect_uri(kind.as_str()),
        scopes: settings
            .scopes
            .into_iter()
            .map(|scope| scope.trim().to_string())
            .filter(|scope| !scope.is_empty())
            .collect(),
        endpoints,
        http_timeout: Duration::from_secs(config.provider_http_timeout_seconds),
    })
}

/// Register an adapter for every provider that has credentials configured.
pub fn registry(config: &Config) -> Result<Registry, Error> {
    let mut registry = Registry::new();

    for kind in ProviderKind::ALL {
        match provider_config(config, kind) {
            Some(provider_config) => {
                info!(
                    "Registering {} with redirect URI {}",
                    kind, provider_config.redirect_uri
                );
                registry.register(providers::build(kind, provider_config)?);
            }
            None => info!("{} has no client credentials configured; skipping", kind),
        }
    }

    Ok(registry)
}

/// Register the webhook secret of every registered provider that signs its webhooks.
pub fn webhook_verifier(config: &Config, registry: Arc<Registry>) -> Result<WebhookVerifier, Error> {
    let kinds: Vec<ProviderKind> = registry.kinds().collect();
    let mut verifier = WebhookVerifier::new(registry);

    for kind in kinds {
        let Some(secret) = settings(config, kind)
            .webhook_secret
            .filter(|secret| !secret.is_empty())
        else {
            debug!("No webhook secret for {}; its webhooks will be refused", kind);
            continue;
        };
        verifier = verifier.with_secret(kind, SecretString::new(secret))?;
    }

    Ok(verifier)
}
