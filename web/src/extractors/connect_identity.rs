use crate::params::connect::ConnectParams;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use envelope::Identity;
use log::*;
use service::AppState;
use std::convert::Infallible;

/// Identity of a client opening a socket, resolved from the `token` query parameter or
/// the `Authorization: Bearer` header. Never rejects: without a valid token the
/// connection is anonymous.
pub(crate) struct ConnectIdentity(pub Identity);

impl FromRequestParts<AppState> for ConnectIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        app_state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let params = Query::<ConnectParams>::try_from_uri(&parts.uri)
            .map(|Query(params)| params)
            .unwrap_or_default();
        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let token = auth::extract_token(params.token.as_deref(), authorization);
        let identity = auth::identify(app_state.verifier.as_ref(), token);
        trace!(
            "Resolved connect identity user_id={} (token presented: {})",
            identity.user_id,
            token.is_some()
        );

        Ok(ConnectIdentity(identity))
    }
}
