use serde::Deserialize;
use utoipa::IntoParams;

/// Query parameters accepted on the websocket upgrade request.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct ConnectParams {
    /// Bearer access token. Takes precedence over the `Authorization` header. A missing
    /// or invalid token yields an anonymous connection.
    pub(crate) token: Option<String>,
}
