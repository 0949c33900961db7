use log::{error, info, warn};
use service::{config::Config, logging::Logger};
use std::sync::Arc;
use std::time::Duration;

use domain::Integrations;

/// How often expired OAuth state records are swept.
const STATE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logger: {e}");
        std::process::exit(1);
    }

    info!("Starting up... {:?}", config);

    let integrations = match Integrations::new(&config) {
        Ok(integrations) => Arc::new(integrations),
        Err(e) => {
            error!("Failed to configure provider integrations: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(purge_expired_states(integrations.clone()));

    let app_state = web::AppState::new(config, integrations);
    if let Err(e) = web::init_server(app_state).await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}

async fn purge_expired_states(integrations: Arc<Integrations>) {
    let mut interval = tokio::time::interval(STATE_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = integrations.purge_expired_states().await {
            warn!("State sweep failed: {e}");
        }
    }
}
