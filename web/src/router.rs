use crate::controller::{health_check_controller, hub_controller, ws_controller};
use crate::response::hub_status::HubStatusResponse;
use axum::{routing::get, Router};
use service::AppState;
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// Global definition of the OpenAPI document. To be part
// of the rendered document, a path or schema must be listed here.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "Realtime Gateway API"
        ),
        paths(
            health_check_controller::health_check,
            hub_controller::status,
            ws_controller::connect,
        ),
        components(
            schemas(
                HubStatusResponse,
            )
        ),
        tags(
            (name = "realtime_gateway", description = "Websocket gateway between clients and backend services")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(hub_routes(app_state.clone()))
        .merge(ws_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi2.json", ApiDoc::openapi()).path("/rapidoc"))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn hub_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/hub/status", get(hub_controller::status))
        .with_state(app_state)
}

fn ws_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_controller::connect))
        .with_state(app_state)
}
