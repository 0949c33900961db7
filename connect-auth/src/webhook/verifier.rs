//! Per-provider webhook authentication.

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, warn};

use super::{HmacWebhookValidator, ProviderEvent, WebhookValidator};
use crate::error::{configuration_error, ConfigurationErrorKind, Error, ErrorKind};
use crate::oauth::{ProviderKind, Registry};

/// An inbound webhook request, held only while it is being handled.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub provider: ProviderKind,
    pub raw_body: Vec<u8>,
    pub signature_header: Option<String>,
    verified: bool,
}

impl WebhookEvent {
    pub fn new(provider: ProviderKind, raw_body: Vec<u8>, signature_header: Option<String>) -> Self {
        Self {
            provider,
            raw_body,
            signature_header,
            verified: false,
        }
    }

    pub fn verified(&self) -> bool {
        self.verified
    }
}

/// Authenticates webhook bodies against each provider's shared secret and interprets the
/// ones that pass.
pub struct WebhookVerifier {
    registry: Arc<Registry>,
    validators: HashMap<ProviderKind, HmacWebhookValidator>,
}

impl WebhookVerifier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            validators: HashMap::new(),
        }
    }

    /// Register the shared secret for a configured provider that signs its webhooks.
    pub fn with_secret(mut self, provider: ProviderKind, secret: SecretString) -> Result<Self, Error> {
        let scheme = self.registry.get(provider)?.signature_scheme().ok_or_else(|| {
            configuration_error(
                ConfigurationErrorKind::ProviderNotConfigured,
                &format!("{} does not send signed webhooks", provider),
            )
        })?;

        self.validators
            .insert(provider, HmacWebhookValidator::new(provider, secret, scheme));
        Ok(self)
    }

    /// Whether webhooks from `provider` can be authenticated at all.
    pub fn accepts(&self, provider: ProviderKind) -> bool {
        self.validators.contains_key(&provider)
    }

    /// Header the provider puts its signature in.
    pub fn signature_header(&self, provider: ProviderKind) -> Option<&'static str> {
        self.validators
            .get(&provider)
            .map(|validator| validator.scheme().header())
    }

    /// Check a raw body against the provider's signature header.
    ///
    /// False on a missing secret, a malformed header, or a mismatch. Failures are logged
    /// without the secret or the signature.
    pub fn verify(
        &self,
        provider: ProviderKind,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> bool {
        self.check(provider, raw_body, signature_header).is_ok()
    }

    /// Verify `event` and, only if it passes, parse its body.
    pub fn authenticate(&self, event: &mut WebhookEvent) -> Result<ProviderEvent, Error> {
        self.check(
            event.provider,
            &event.raw_body,
            event.signature_header.as_deref(),
        )?;
        event.verified = true;

        let parsed = self.registry.get(event.provider)?.parse_webhook(&event.raw_body)?;
        debug!("Verified {} webhook: {:?}", event.provider, parsed);
        Ok(parsed)
    }

    fn check(
        &self,
        provider: ProviderKind,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<(), Error> {
        let validator = self.validators.get(&provider).ok_or_else(|| {
            configuration_error(
                ConfigurationErrorKind::MissingCredentials,
                &format!("No webhook secret configured for {}", provider),
            )
        })?;

        validator
            .validate(signature_header, raw_body)
            .inspect_err(|e| match &e.error_kind {
                ErrorKind::Signature(kind) => {
                    warn!(
                        "Rejected {} webhook ({} bytes): {:?}",
                        provider,
                        raw_body.len(),
                        kind
                    )
                }
                _ => warn!("Could not verify {} webhook: {}", provider, e),
            })
    }
}
