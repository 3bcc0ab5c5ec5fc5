use crate::response::hub_status::HubStatusResponse;
use axum::extract::State;
use axum::Json;
use log::*;
use service::AppState;

/// GET current connection figures of the hub
#[utoipa::path(
    get,
    path = "/hub/status",
    responses(
        (status = 200, description = "Live connection and authenticated user counts", body = HubStatusResponse),
    )
)]
pub async fn status(State(app_state): State<AppState>) -> Json<HubStatusResponse> {
    let status = app_state.hub.status();
    trace!("Hub status: {status:?}");
    Json(status.into())
}
