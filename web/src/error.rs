use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use domain::error::{DomainErrorKind, Error as DomainError, InternalErrorKind};
use log::*;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Domain(DomainError),
    Web(WebErrorKind),
}

/// Request problems detected before the domain layer is involved.
#[derive(Debug, PartialEq)]
pub enum WebErrorKind {
    Input,
    /// The callback `state` is absent or does not match the state cookie.
    StateMismatch,
}

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

// List of possible StatusCode variants https://docs.rs/http/latest/http/status/struct.StatusCode.html#associatedconstant.UNPROCESSABLE_ENTITY
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Web(web_error_kind) => match web_error_kind {
                WebErrorKind::Input => (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response(),
                WebErrorKind::StateMismatch => {
                    warn!("OAuth callback state did not match the state cookie");
                    (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response()
                }
            },
            Error::Domain(domain_error) => match domain_error.error_kind {
                DomainErrorKind::Internal(internal_error_kind) => match internal_error_kind {
                    InternalErrorKind::Invalid(invalid_error_kind) => {
                        debug!("Invalid request: {:?}", invalid_error_kind);
                        (StatusCode::BAD_REQUEST, "BAD REQUEST").into_response()
                    }
                    InternalErrorKind::Unauthenticated | InternalErrorKind::NotLinked => {
                        (StatusCode::UNAUTHORIZED, "UNAUTHORIZED").into_response()
                    }
                    InternalErrorKind::NotFound => {
                        (StatusCode::NOT_FOUND, "NOT FOUND").into_response()
                    }
                    InternalErrorKind::Config => {
                        error!("Configuration error: {:?}", domain_error.source);
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR")
                            .into_response()
                    }
                    InternalErrorKind::Storage | InternalErrorKind::Other(_) => {
                        error!("Internal error: {:?}", domain_error.source);
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR")
                            .into_response()
                    }
                },
                DomainErrorKind::External(external_error_kind) => {
                    warn!("Provider error: {:?}", external_error_kind);
                    (StatusCode::BAD_GATEWAY, "BAD GATEWAY").into_response()
                }
            },
        }
    }
}

impl<E> From<E> for Error
where
    E: Into<DomainError>,
{
    fn from(err: E) -> Self {
        Self::Domain(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::error::{ExternalErrorKind, InvalidErrorKind};

    fn status_of(error_kind: DomainErrorKind) -> StatusCode {
        Error::Domain(DomainError {
            source: None,
            error_kind,
        })
        .into_response()
        .status()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_of(DomainErrorKind::Internal(InternalErrorKind::Config)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(DomainErrorKind::Internal(InternalErrorKind::Invalid(
                InvalidErrorKind::State
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(DomainErrorKind::Internal(InternalErrorKind::NotLinked)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(DomainErrorKind::Internal(InternalErrorKind::Unauthenticated)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(DomainErrorKind::External(ExternalErrorKind::Timeout)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Web(WebErrorKind::StateMismatch)
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_configuration_error_body_is_generic() {
        let response = Error::Domain(DomainError {
            source: Some("instagram client secret is missing".into()),
            error_kind: DomainErrorKind::Internal(InternalErrorKind::Config),
        })
        .into_response();

        let body = crate::test_support::body_string(response).await;
        assert_eq!(body, "INTERNAL SERVER ERROR");
    }
}
