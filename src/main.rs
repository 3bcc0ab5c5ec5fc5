use auth::JwtVerifier;
use broker::transport::MemoryTransport;
use broker::{Broker, Context};
use envelope::Envelope;
use hub::Hub;
use log::*;
use service::{config::Config, logging::Logger, AppState};
use std::sync::Arc;

/// Local action answering with the hub's live connection figures.
const STATUS_ACTION: &str = "system.status";

#[tokio::main]
async fn main() {
    let config = get_config();

    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
    }

    info!("Starting up realtime gateway...");

    if config.uses_dev_jwt_secret() {
        if config.is_production() {
            warn!("JWT_SECRET is not set: tokens are verified with the development secret");
        } else {
            debug!("Using the development JWT secret");
        }
    }

    let transport = Arc::new(MemoryTransport::new());
    let broker = Broker::new(transport, config.broker_config());

    let hub = Hub::new(config.hub_config());
    register_system_actions(&hub);
    if let Err(e) = hub.attach(broker.clone()).await {
        error!("Failed to attach the hub to the broker: {e}");
        std::process::exit(1);
    }
    let maintenance = hub.spawn_maintenance();

    let verifier = Arc::new(JwtVerifier::new(config.jwt_secret()));
    let shutdown_timeout = config.shutdown_timeout();
    let app_state = AppState::new(config, hub.clone(), verifier);

    if let Err(e) = web::init_server(app_state, shutdown_signal()).await {
        error!("{e}");
    }

    hub.shutdown();
    if tokio::time::timeout(shutdown_timeout, broker.shutdown())
        .await
        .is_err()
    {
        warn!("Broker did not shut down within {shutdown_timeout:?}");
    }
    maintenance.abort();
    info!("Realtime gateway stopped");
}

fn get_config() -> Config {
    Config::new()
}

fn register_system_actions(hub: &Hub) {
    let status_hub = hub.clone();
    hub.on(STATUS_ACTION, move |env: Envelope, ctx: Context| {
        let hub = status_hub.clone();
        async move {
            if let Err(e) = ctx.reply(&env, &hub.status()).await {
                warn!("Failed to reply to {STATUS_ACTION}: {e}");
            }
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => error!("Failed to listen for the shutdown signal: {e}"),
    }
}
