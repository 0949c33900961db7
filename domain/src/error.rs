//! Error types for the `domain` layer.
use connect_auth::error::{
    ErrorKind as ConnectErrorKind, StorageErrorKind, UpstreamErrorKind, ValidationErrorKind,
};
use connect_auth::Error as ConnectAuthError;
use std::error::Error as StdError;
use std::fmt;

/// Top-level domain error type.
/// Errors in the Domain layer are modeled as a tree structure
/// with `domain::error::Error` as the root type holding a tree of `error_kind`
/// enums that represent the kinds of errors that can occur in the domain layer or
/// in lower layers. The `source` field is used to hold the original error that caused
/// the domain error. `web` depends on `domain` but never on `connect-auth` error kinds;
/// the kinds below are what `web` maps to HTTP status codes and redirects.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: DomainErrorKind,
}

/// Enum representing the major categories of errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum DomainErrorKind {
    Internal(InternalErrorKind),
    External(ExternalErrorKind),
}

/// Errors raised by this service itself, or by the caller's request.
#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    /// Missing or malformed configuration, including an unconfigured provider.
    Config,
    Invalid(InvalidErrorKind),
    /// A webhook failed signature verification.
    Unauthenticated,
    /// No token set exists for the requested link.
    NotLinked,
    NotFound,
    Storage,
    Other(String),
}

/// What about the request was invalid. Every kind means the flow has to restart.
#[derive(Debug, PartialEq)]
pub enum InvalidErrorKind {
    State,
    Pkce,
    Payload,
    Request,
}

/// Errors from a provider's endpoints.
#[derive(Debug, PartialEq)]
pub enum ExternalErrorKind {
    Network,
    Timeout,
    Rejected { status: u16 },
    InvalidResponse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Domain Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

// This is where we translate errors from the `connect-auth` layer to the `domain` layer.
impl From<ConnectAuthError> for Error {
    fn from(err: ConnectAuthError) -> Self {
        let error_kind = match &err.error_kind {
            ConnectErrorKind::Configuration(_) => DomainErrorKind::Internal(InternalErrorKind::Config),
            ConnectErrorKind::Validation(kind) => DomainErrorKind::Internal(match kind {
                ValidationErrorKind::MissingState
                | ValidationErrorKind::InvalidState
                | ValidationErrorKind::ExpiredState
                | ValidationErrorKind::ProviderMismatch => {
                    InternalErrorKind::Invalid(InvalidErrorKind::State)
                }
                ValidationErrorKind::MalformedPkceVerifier
                | ValidationErrorKind::MissingPkceVerifier => {
                    InternalErrorKind::Invalid(InvalidErrorKind::Pkce)
                }
                ValidationErrorKind::MalformedPayload => {
                    InternalErrorKind::Invalid(InvalidErrorKind::Payload)
                }
                ValidationErrorKind::UnknownProvider => InternalErrorKind::NotFound,
                ValidationErrorKind::NotLinked => InternalErrorKind::NotLinked,
            }),
            ConnectErrorKind::Upstream(kind) => DomainErrorKind::External(match kind {
                UpstreamErrorKind::Timeout => ExternalErrorKind::Timeout,
                UpstreamErrorKind::Network => ExternalErrorKind::Network,
                UpstreamErrorKind::Rejected { status } => {
                    ExternalErrorKind::Rejected { status: *status }
                }
                UpstreamErrorKind::InvalidResponse => ExternalErrorKind::InvalidResponse,
            }),
            ConnectErrorKind::Signature(_) => {
                DomainErrorKind::Internal(InternalErrorKind::Unauthenticated)
            }
            ConnectErrorKind::Storage(StorageErrorKind::NotFound) => {
                DomainErrorKind::Internal(InternalErrorKind::NotFound)
            }
            ConnectErrorKind::Storage(StorageErrorKind::Backend) => {
                DomainErrorKind::Internal(InternalErrorKind::Storage)
            }
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: DomainErrorKind::Internal(InternalErrorKind::Config),
        }
    }
}

/// Helper function to create domain errors with a message as the source.
pub(crate) fn domain_error(error_kind: DomainErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_auth::error::{
        signature_error, upstream_error, validation_error, SignatureErrorKind,
    };

    #[test]
    fn test_state_failures_collapse_to_invalid_state() {
        for kind in [
            ValidationErrorKind::MissingState,
            ValidationErrorKind::InvalidState,
            ValidationErrorKind::ExpiredState,
            ValidationErrorKind::ProviderMismatch,
        ] {
            let err: Error = validation_error(kind, "bad state").into();
            assert_eq!(
                err.error_kind,
                DomainErrorKind::Internal(InternalErrorKind::Invalid(InvalidErrorKind::State))
            );
        }
    }

    #[test]
    fn test_upstream_rejection_keeps_status() {
        let err: Error = upstream_error(UpstreamErrorKind::Rejected { status: 401 }, "nope").into();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::External(ExternalErrorKind::Rejected { status: 401 })
        );
        assert!(err.source.is_some());
    }

    #[test]
    fn test_signature_failure_is_unauthenticated() {
        let err: Error = signature_error(SignatureErrorKind::Mismatch, "mismatch").into();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::Unauthenticated)
        );
    }

    #[test]
    fn test_unknown_provider_is_not_found() {
        let err: Error = "snapchat"
            .parse::<connect_auth::oauth::ProviderKind>()
            .unwrap_err()
            .into();
        assert_eq!(
            err.error_kind,
            DomainErrorKind::Internal(InternalErrorKind::NotFound)
        );
    }
}
