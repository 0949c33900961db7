//! HMAC-SHA256 webhook signature validation.

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{SignatureScheme, WebhookValidator};
use crate::error::{
    configuration_error, signature_error, ConfigurationErrorKind, Error, SignatureErrorKind,
};
use crate::oauth::ProviderKind;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 webhook validator for one provider's shared secret.
pub struct HmacWebhookValidator {
    provider: ProviderKind,
    secret: SecretString,
    scheme: SignatureScheme,
}

impl HmacWebhookValidator {
    /// Create a new HMAC webhook validator.
    ///
    /// # Arguments
    ///
    /// * `provider` - Provider the secret belongs to
    /// * `secret` - Webhook signing secret
    /// * `scheme` - Header layout the provider signs with
    pub fn new(provider: ProviderKind, secret: SecretString, scheme: SignatureScheme) -> Self {
        Self {
            provider,
            secret,
            scheme,
        }
    }

    pub fn scheme(&self) -> &SignatureScheme {
        &self.scheme
    }

    /// Validate against an explicit clock, in unix seconds.
    pub fn validate_at(
        &self,
        signature_header: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), Error> {
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                signature_error(
                    SignatureErrorKind::MissingHeader,
                    &format!("Missing signature header: {}", self.scheme.header()),
                )
            })?;

        let (provided, expected) = match &self.scheme {
            SignatureScheme::PrefixedHex { prefix, .. } => {
                let provided = header.strip_prefix(prefix).ok_or_else(|| {
                    signature_error(
                        SignatureErrorKind::MalformedHeader,
                        "Signature header has the wrong prefix",
                    )
                })?;
                (provided, self.digest(&[body])?)
            }
            SignatureScheme::Timestamped {
                tolerance_seconds, ..
            } => {
                let (timestamp, provided) = parse_timestamped(header)?;
                let issued: i64 = timestamp.parse().map_err(|_| {
                    signature_error(SignatureErrorKind::MalformedHeader, "Invalid timestamp")
                })?;
                let skew = now.saturating_sub(issued).saturating_abs();
                if skew > *tolerance_seconds {
                    return Err(signature_error(
                        SignatureErrorKind::StaleTimestamp,
                        &format!("Signature timestamp is {}s from now", skew),
                    ));
                }
                (
                    provided,
                    self.digest(&[timestamp.as_bytes(), b".", body])?,
                )
            }
        };

        if !is_lower_hex(provided) {
            return Err(signature_error(
                SignatureErrorKind::MalformedHeader,
                "Signature is not lowercase hex",
            ));
        }

        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(signature_error(
                SignatureErrorKind::Mismatch,
                "Signature does not match body",
            ))
        }
    }

    /// Produce a header value for `body` as the provider would send it.
    pub fn sign(&self, body: &[u8], now: i64) -> Result<String, Error> {
        match &self.scheme {
            SignatureScheme::PrefixedHex { prefix, .. } => {
                Ok(format!("{}{}", prefix, self.digest(&[body])?))
            }
            SignatureScheme::Timestamped { .. } => {
                let timestamp = now.to_string();
                let digest = self.digest(&[timestamp.as_bytes(), b".", body])?;
                Ok(format!("t={},s={}", timestamp, digest))
            }
        }
    }

    fn digest(&self, parts: &[&[u8]]) -> Result<String, Error> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| {
                configuration_error(ConfigurationErrorKind::MissingCredentials, "Invalid HMAC key")
            })?;
        for part in parts {
            mac.update(part);
        }
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl WebhookValidator for HmacWebhookValidator {
    fn validate(&self, signature_header: Option<&str>, body: &[u8]) -> Result<(), Error> {
        self.validate_at(signature_header, body, Utc::now().timestamp())
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }
}

fn parse_timestamped(header: &str) -> Result<(&str, &str), Error> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("s", value)) => signature = Some(value),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(signature_error(
            SignatureErrorKind::MalformedHeader,
            "Expected t=<timestamp>,s=<signature>",
        )),
    }
}

fn is_lower_hex(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
