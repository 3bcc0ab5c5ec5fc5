//! HTTP surface of the gateway: the `/ws` websocket upgrade plus health, status and
//! API documentation endpoints.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use error::{error, ErrorKind};
use log::*;
use service::AppState;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub use error::{Error, Result};

mod controller;
pub mod error;
mod extractors;
mod params;
mod response;
pub mod router;

/// Binds the configured interface and port and serves until `shutdown` resolves.
pub async fn init_server<F>(app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let host = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let address = format!("{host}:{}", app_state.config.port);

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| error(ErrorKind::Bind(address.clone()), e))?;

    serve(listener, app_state, shutdown).await
}

/// Serves the gateway on an already bound listener. Once `shutdown` resolves the hub
/// closes every open socket and in-flight HTTP requests are drained.
pub async fn serve<F>(listener: TcpListener, app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cors_layer = cors_layer(&app_state.config.allowed_origins)?;
    let hub = app_state.hub.clone();

    if let Ok(address) = listener.local_addr() {
        info!("Server starting... listening for connections on http://{address}");
    }

    let app = router::define_routes(app_state).layer(cors_layer);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown signal received, closing open connections");
            hub.shutdown();
        })
        .await
        .map_err(|e| error(ErrorKind::Serve, e))
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|e| error(ErrorKind::InvalidOrigin(origin.clone()), e))
        })
        .collect::<Result<Vec<_>>>()?;
    debug!("Allowed CORS origins: {allowed_origins:?}");

    Ok(CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_credentials(true)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(origins))
}
