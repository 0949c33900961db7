//! Controller for provider webhooks.
//!
//! The body is taken as raw bytes so the signature is checked over exactly what the provider
//! sent; nothing is parsed until it verifies.

use crate::{AppState, Error};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use domain::{parse_provider, WebhookAck};
use log::*;
use serde_json::json;

/// POST /webhooks/{provider}
///
/// Handles deauthorization and data-deletion notifications.
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(
        ("provider" = String, Path, description = "instagram or tiktok"),
    ),
    request_body(content = String, description = "Raw signed provider payload"),
    responses(
        (status = 200, description = "Acknowledged; data-deletion requests get {url, confirmation_code}"),
        (status = 400, description = "Verified body could not be parsed"),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Unknown provider, or provider webhooks not configured"),
    )
)]
pub async fn receive(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let provider = parse_provider(&provider)?;
    let integrations = &app_state.integrations;

    let signature = integrations
        .signature_header(provider)
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    debug!("Received {} webhook ({} bytes)", provider, body.len());

    let response = match integrations
        .handle_webhook(provider, body.to_vec(), signature)
        .await?
    {
        WebhookAck::Acknowledged => {
            (StatusCode::OK, Json(json!({ "success": true }))).into_response()
        }
        WebhookAck::DataDeletion(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
    };
    Ok(response)
}
