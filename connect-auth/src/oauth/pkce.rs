//! PKCE (Proof Key for Code Exchange) support for OAuth 2.0.
//!
//! Implements RFC 7636 S256 challenges. The verifier only ever leaves the process in the final
//! token-exchange request.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::{validation_error, Error, ValidationErrorKind};

/// Challenge method declared to the provider.
pub const CHALLENGE_METHOD: &str = "S256";

const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

/// PKCE code verifier (random string).
#[derive(Clone)]
pub struct PkceVerifier(SecretString);

impl PkceVerifier {
    /// Generate a new random PKCE verifier.
    ///
    /// 32 random bytes, base64url encoded without padding: 43 characters, 256 bits of entropy.
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::thread_rng().gen();
        Self(SecretString::new(URL_SAFE_NO_PAD.encode(random_bytes)))
    }

    /// Parse a verifier read back from a flow context.
    ///
    /// Rejects anything outside 43-128 characters of the RFC 7636 unreserved set.
    pub fn parse(verifier: &str) -> Result<Self, Error> {
        let well_formed = (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len())
            && verifier
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));

        if !well_formed {
            return Err(validation_error(
                ValidationErrorKind::MalformedPkceVerifier,
                "PKCE verifier must be 43-128 unreserved characters",
            ));
        }

        Ok(Self(SecretString::new(verifier.to_string())))
    }

    /// Get the verifier string. Only for the token-exchange request body.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Generate the corresponding code challenge.
    pub fn challenge(&self) -> PkceChallenge {
        PkceChallenge::from_verifier(self)
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PkceVerifier([REDACTED])")
    }
}

/// PKCE code challenge (SHA256 hash of verifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    /// Create a code challenge from a verifier.
    ///
    /// Uses SHA256 hashing and base64url encoding as per RFC 7636.
    pub fn from_verifier(verifier: &PkceVerifier) -> Self {
        let hash = Sha256::digest(verifier.expose().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hash))
    }

    /// Get the challenge string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A verifier and its challenge, created per flow start.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: PkceVerifier,
    pub challenge: PkceChallenge,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = PkceVerifier::generate();
        let challenge = verifier.challenge();
        Self {
            verifier,
            challenge,
        }
    }
}
