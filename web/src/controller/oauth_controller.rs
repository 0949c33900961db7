//! Controller for provider account linking.
//!
//! Browser-facing: `start` and `callback` answer with redirects. The state value travels in a
//! provider-scoped cookie as well as through the provider, and the two must match.

use crate::{AppState, Error, WebErrorKind};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use domain::error::DomainErrorKind;
use domain::{parse_provider, ConnectOutcome, FailureReason, ProviderKind};
use log::*;
use serde::Deserialize;
use subtle::ConstantTimeEq;

const STATE_COOKIE_PATH: &str = "/auth";

/// Query parameters identifying the application user.
#[derive(Debug, Deserialize)]
pub struct UserParams {
    pub user_id: String,
}

/// Query parameters of a provider redirect back to us.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

fn state_cookie_name(provider: ProviderKind) -> String {
    format!("oauth_state_{}", provider)
}

fn found(location: &str) -> (StatusCode, [(header::HeaderName, String); 1]) {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())])
}

fn states_match(query_state: &str, cookie_state: &str) -> bool {
    !query_state.is_empty() && bool::from(query_state.as_bytes().ct_eq(cookie_state.as_bytes()))
}

/// GET /auth/{provider}/start
///
/// Begins linking a provider account by redirecting to the provider's consent page.
#[utoipa::path(
    get,
    path = "/auth/{provider}/start",
    params(
        ("provider" = String, Path, description = "instagram, tiktok or google_photos"),
        ("user_id" = String, Query, description = "User to link the provider account to"),
    ),
    responses(
        (status = 302, description = "Redirect to the provider authorization endpoint, with the state cookie set"),
        (status = 400, description = "Missing user_id"),
        (status = 404, description = "Unknown provider"),
        (status = 500, description = "Provider not configured"),
    )
)]
pub async fn start(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<UserParams>,
    jar: CookieJar,
) -> Result<impl IntoResponse, Error> {
    let provider = parse_provider(&provider)?;
    let integrations = &app_state.integrations;

    let request = integrations.start_link(&params.user_id, provider).await?;

    let cookie = Cookie::build((state_cookie_name(provider), request.state.value))
        .path(STATE_COOKIE_PATH)
        .http_only(true)
        .secure(app_state.config.secure_cookies())
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(
            integrations.state_ttl().num_seconds(),
        ));

    info!(
        "Redirecting user {} to {} authorization",
        params.user_id, provider
    );
    Ok((jar.add(cookie), found(request.url.as_str())))
}

/// GET /auth/{provider}/callback
///
/// Handles the provider redirect after the user granted or declined consent.
#[utoipa::path(
    get,
    path = "/auth/{provider}/callback",
    params(
        ("provider" = String, Path, description = "instagram, tiktok or google_photos"),
        ("code" = Option<String>, Query, description = "Authorization code"),
        ("state" = Option<String>, Query, description = "State value issued by start"),
        ("error" = Option<String>, Query, description = "Set when the user declined"),
    ),
    responses(
        (status = 302, description = "Redirect to the application with status=connected or status=error"),
        (status = 400, description = "State missing, mismatched, expired or already used"),
        (status = 404, description = "Unknown provider"),
        (status = 500, description = "Provider not configured"),
    )
)]
pub async fn callback(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return Error::from(e).into_response(),
    };

    let cookie_name = state_cookie_name(provider);
    let cookie_state = jar.get(&cookie_name).map(|cookie| cookie.value().to_owned());
    let jar = jar.remove(Cookie::build(cookie_name).path(STATE_COOKIE_PATH));

    match complete(&app_state, provider, cookie_state, params).await {
        Ok(location) => (jar, found(&location)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn complete(
    app_state: &AppState,
    provider: ProviderKind,
    cookie_state: Option<String>,
    params: CallbackParams,
) -> Result<String, Error> {
    let integrations = &app_state.integrations;

    let state = params.state.unwrap_or_default();
    if !cookie_state.is_some_and(|cookie_state| states_match(&state, &cookie_state)) {
        return Err(Error::Web(WebErrorKind::StateMismatch));
    }

    if let Some(error) = params.error {
        info!(
            "{} authorization declined: {} ({})",
            provider,
            error,
            params.error_description.as_deref().unwrap_or("no description")
        );
        if let Err(e) = integrations.decline_link(provider, &state).await {
            warn!("Could not settle declined {} link: {}", provider, e);
        }
        return Ok(integrations.app_redirect(provider, ConnectOutcome::Failed(FailureReason::Denied)));
    }

    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or(Error::Web(WebErrorKind::Input))?;

    match integrations.complete_link(provider, &code, &state).await {
        Ok(status) => {
            info!("Connected {} for user {}", provider, status.owner_id);
            Ok(integrations.app_redirect(provider, ConnectOutcome::Connected))
        }
        Err(e) if matches!(e.error_kind, DomainErrorKind::External(_)) => {
            warn!("{} token exchange failed: {}", provider, e);
            let reason = FailureReason::from_error(&e);
            Ok(integrations.app_redirect(provider, ConnectOutcome::Failed(reason)))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /auth/{provider}/status
///
/// Returns the link state for a user, and scopes and expiry when linked. Never the token.
#[utoipa::path(
    get,
    path = "/auth/{provider}/status",
    params(
        ("provider" = String, Path, description = "instagram, tiktok or google_photos"),
        ("user_id" = String, Query, description = "User whose link to report"),
    ),
    responses(
        (status = 200, description = "Link state: unlinked, link_pending, linked, refreshing or expired"),
        (status = 404, description = "Unknown provider"),
    )
)]
pub async fn status(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<UserParams>,
) -> Result<impl IntoResponse, Error> {
    let provider = parse_provider(&provider)?;
    let status = app_state
        .integrations
        .status(&params.user_id, provider)
        .await?;
    Ok(Json(status))
}

/// DELETE /auth/{provider}
///
/// Unlinks the provider account and discards its tokens. Unlinking twice succeeds.
#[utoipa::path(
    delete,
    path = "/auth/{provider}",
    params(
        ("provider" = String, Path, description = "instagram, tiktok or google_photos"),
        ("user_id" = String, Query, description = "User to unlink"),
    ),
    responses(
        (status = 204, description = "Unlinked"),
        (status = 404, description = "Unknown provider"),
    )
)]
pub async fn unlink(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<UserParams>,
) -> Result<impl IntoResponse, Error> {
    let provider = parse_provider(&provider)?;
    app_state
        .integrations
        .unlink(&params.user_id, provider)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
