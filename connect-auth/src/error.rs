//! Error types for the `connect-auth` crate.
//!
//! Follows the same pattern as domain::error with a root Error struct and error kind enums.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for connect-auth crate.
/// Holds error kind and optional source for error chaining.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in connect-auth.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Configuration(ConfigurationErrorKind),
    Validation(ValidationErrorKind),
    Upstream(UpstreamErrorKind),
    Signature(SignatureErrorKind),
    Storage(StorageErrorKind),
}

/// Missing or malformed client credentials and endpoints.
#[derive(Debug, PartialEq)]
pub enum ConfigurationErrorKind {
    MissingCredentials,
    ProviderNotConfigured,
    InvalidUrl,
}

/// Errors that require the caller to restart the link flow from scratch.
#[derive(Debug, PartialEq)]
pub enum ValidationErrorKind {
    MissingState,
    InvalidState,
    ExpiredState,
    ProviderMismatch,
    MalformedPkceVerifier,
    MissingPkceVerifier,
    UnknownProvider,
    MalformedPayload,
    NotLinked,
}

/// Errors from a provider's token or refresh endpoint.
#[derive(Debug, PartialEq)]
pub enum UpstreamErrorKind {
    Timeout,
    Network,
    Rejected { status: u16 },
    InvalidResponse,
}

/// Errors from inbound webhook signature checks.
#[derive(Debug, PartialEq)]
pub enum SignatureErrorKind {
    MissingHeader,
    MalformedHeader,
    Mismatch,
    StaleTimestamp,
}

/// Errors from the token store.
#[derive(Debug, PartialEq)]
pub enum StorageErrorKind {
    NotFound,
    Backend,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Configuration(kind) => write!(f, "Configuration error: {:?}", kind),
            ErrorKind::Validation(kind) => write!(f, "Validation error: {:?}", kind),
            ErrorKind::Upstream(kind) => write!(f, "Upstream error: {:?}", kind),
            ErrorKind::Signature(kind) => write!(f, "Signature error: {:?}", kind),
            ErrorKind::Storage(kind) => write!(f, "Storage error: {:?}", kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let error_kind = if err.is_timeout() {
            ErrorKind::Upstream(UpstreamErrorKind::Timeout)
        } else if err.is_decode() {
            ErrorKind::Upstream(UpstreamErrorKind::InvalidResponse)
        } else if err.is_builder() {
            ErrorKind::Configuration(ConfigurationErrorKind::InvalidUrl)
        } else {
            ErrorKind::Upstream(UpstreamErrorKind::Network)
        };

        // reqwest errors carry the request URL, which may include query-string credentials.
        Error {
            source: Some(Box::new(err.without_url())),
            error_kind,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Configuration(ConfigurationErrorKind::InvalidUrl),
        }
    }
}

impl Error {
    /// True when the provider answered and refused the grant, as opposed to a transport
    /// failure or a provider-side outage.
    pub fn is_provider_rejection(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::Upstream(UpstreamErrorKind::Rejected { status }) if status < 500
        )
    }
}

/// Helper function to create configuration errors.
pub fn configuration_error(kind: ConfigurationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Configuration(kind),
    }
}

/// Helper function to create validation errors.
pub fn validation_error(kind: ValidationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Validation(kind),
    }
}

/// Helper function to create upstream errors.
pub fn upstream_error(kind: UpstreamErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Upstream(kind),
    }
}

/// Helper function to create signature errors.
pub fn signature_error(kind: SignatureErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Signature(kind),
    }
}
