use axum::{
    Router,
    routing::{get, post},
};

pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;

use crate::auth::AppState;

/// Auth routes plus the bearer-protected conversation routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::require_auth,
        ));

    public_routes.merge(protected_routes).with_state(state)
}
