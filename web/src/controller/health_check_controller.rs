use axum::http::StatusCode;
use axum::response::IntoResponse;

/// GET liveness of the HTTP surface
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Gateway is up and responding to requests", body = String),
    )
)]
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}
