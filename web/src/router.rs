use crate::{
    controller::{
        data_deletion_controller, health_check_controller, oauth_controller, webhook_controller,
    },
    AppState,
};
use axum::{
    routing::{delete, get, post},
    Router,
};

use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// This is the global definition of our OpenAPI spec. To be a part
// of the rendered spec, a path must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Social Connect API"
        ),
        paths(
            health_check_controller::health_check,
            oauth_controller::start,
            oauth_controller::callback,
            oauth_controller::status,
            oauth_controller::unlink,
            webhook_controller::receive,
            data_deletion_controller::read,
        ),
        tags(
            (name = "social_connect", description = "Instagram, TikTok and Google Photos account linking")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(oauth_routes(app_state.clone()))
        .merge(webhook_routes(app_state.clone()))
        .merge(data_deletion_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn oauth_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/auth/{provider}/start", get(oauth_controller::start))
        .route("/auth/{provider}/callback", get(oauth_controller::callback))
        .route("/auth/{provider}/status", get(oauth_controller::status))
        .route("/auth/{provider}", delete(oauth_controller::unlink))
        .with_state(app_state)
}

fn webhook_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/webhooks/{provider}", post(webhook_controller::receive))
        .with_state(app_state)
}

fn data_deletion_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/data-deletion/{code}", get(data_deletion_controller::read))
        .with_state(app_state)
}
