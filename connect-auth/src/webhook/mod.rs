//! Webhook signature validation and payload types.

mod hmac;
mod verifier;

pub use hmac::HmacWebhookValidator;
pub use verifier::{WebhookEvent, WebhookVerifier};

use serde::Serialize;

use crate::error::Error;
use crate::oauth::ProviderKind;

/// Default accepted clock skew for timestamped signatures.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECONDS: i64 = 300;

/// How a provider signs webhook bodies with its shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureScheme {
    /// `<prefix><hex>` where hex is HMAC-SHA256 of the raw body,
    /// e.g. `X-Hub-Signature-256: sha256=<hex>`.
    PrefixedHex {
        header: &'static str,
        prefix: &'static str,
    },
    /// `t=<unix seconds>,s=<hex>` where hex is HMAC-SHA256 of `"<t>.<raw body>"`.
    Timestamped {
        header: &'static str,
        tolerance_seconds: i64,
    },
}

impl SignatureScheme {
    /// Name of the request header carrying the signature.
    pub fn header(&self) -> &'static str {
        match self {
            SignatureScheme::PrefixedHex { header, .. } => header,
            SignatureScheme::Timestamped { header, .. } => header,
        }
    }
}

/// A verified provider notification, reduced to what the application acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// The user revoked the application's access on the provider side.
    Deauthorization { account_id: String },
    /// The provider requires the user's data to be purged.
    DataDeletion { account_id: String },
    /// Anything else the provider sends; acknowledged and dropped.
    Ignored { event: String },
}

/// Trait for validating webhook signatures.
pub trait WebhookValidator: Send + Sync {
    /// Validate a webhook request.
    ///
    /// # Arguments
    ///
    /// * `signature_header` - Value of the provider's signature header, if present
    /// * `body` - Raw request body bytes, before any parsing
    fn validate(&self, signature_header: Option<&str>, body: &[u8]) -> Result<(), Error>;

    /// The provider this validator holds the secret for.
    fn provider(&self) -> ProviderKind;
}
