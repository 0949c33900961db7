use std::io;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use domain::Integrations;
use log::*;
use service::config::Config;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

mod controller;
mod error;
pub mod router;

pub use error::{Error, Result, WebErrorKind};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub integrations: Arc<Integrations>,
}

impl AppState {
    pub fn new(config: Config, integrations: Arc<Integrations>) -> Self {
        Self {
            config,
            integrations,
        }
    }
}

/// Serve the router on the configured interface and port until the process exits.
pub async fn init_server(app_state: AppState) -> io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let host = format!("{}:{}", interface, app_state.config.port);

    // The frontend reads link status and unlinks from its own origin.
    let app_origin = HeaderValue::from_str(app_state.config.app_base_url())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let cors_layer = CorsLayer::new()
        .allow_origin(app_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    info!("Server starting... listening for connections on http://{}", host);

    let listener = TcpListener::bind(&host).await?;
    axum::serve(listener, router::define_routes(app_state).layer(cors_layer)).await
}
