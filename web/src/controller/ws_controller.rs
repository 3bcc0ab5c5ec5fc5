use crate::extractors::connect_identity::ConnectIdentity;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use envelope::Identity;
use futures::{future, SinkExt, StreamExt};
use hub::Hub;
use log::*;
use service::AppState;

/// GET upgrade to a realtime websocket connection
///
/// Every text frame is an envelope. A valid token in the `token` query parameter or
/// an `Authorization: Bearer` header identifies the client; otherwise it is anonymous.
#[utoipa::path(
    get,
    path = "/ws",
    params(crate::params::connect::ConnectParams),
    responses(
        (status = 101, description = "Switched to the websocket protocol"),
        (status = 400, description = "Not a websocket upgrade request"),
    )
)]
pub async fn connect(
    ws: WebSocketUpgrade,
    ConnectIdentity(identity): ConnectIdentity,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    debug!("Upgrading websocket for user_id={}", identity.user_id);
    let hub = app_state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, identity))
}

async fn handle_socket(socket: WebSocket, hub: Hub, identity: Identity) {
    let (sink, stream) = socket.split();

    // Control frames are answered by axum itself; only data frames reach the hub.
    let reader = stream.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
            Err(e) => Some(Err(e)),
        })
    });
    let writer =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));

    hub.serve(identity, reader, writer).await;
}
