use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use grelay_core::GatewayError;

use crate::respond::error_response;
use crate::state::AppState;

/// Client API key validated by the auth middleware, available to handlers
/// through request extensions.
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

pub async fn require_client_key(
    State(state): State<Arc<AppState>>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let Some(key) = bearer_token(req.headers()) else {
        return error_response(GatewayError::unauthorized("missing API key"));
    };

    let settings = state.settings.load();
    if !settings.is_client_key(&key) {
        debug!("rejected unknown client key");
        return error_response(GatewayError::unauthorized("invalid API key"));
    }

    req.extensions_mut().insert(ClientKey(key));
    next.run(req).await
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}
