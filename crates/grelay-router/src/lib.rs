pub mod auth;
pub mod handlers;
pub mod respond;
pub mod state;

mod pipeline;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embedded", post(handlers::embeddings))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_client_key,
        ))
        .with_state(state)
}
