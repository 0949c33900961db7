//! Status lookups for provider data-deletion requests, linked from the confirmation URL.

use crate::{AppState, Error};

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use log::*;

/// GET /data-deletion/{code}
///
/// Returns the status of the deletion request behind a confirmation code.
#[utoipa::path(
    get,
    path = "/data-deletion/{code}",
    params(
        ("code" = String, Path, description = "Confirmation code returned to the provider"),
    ),
    responses(
        (status = 200, description = "Deletion request status (pending or completed) and due date"),
        (status = 404, description = "Unknown confirmation code"),
    )
)]
pub async fn read(
    State(app_state): State<AppState>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, Error> {
    debug!("GET data deletion status");
    let request = app_state.integrations.deletion_status(&code).await?;
    Ok(Json(request))
}
