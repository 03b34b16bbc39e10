use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;
use uuid::Uuid;

use swapmeet_types::api::{Claims, SendMessageRequest};

use crate::auth::AppState;
use crate::error::{ApiError, with_db};

/// GET /conversations/{id}/messages: full history, oldest first. Marks the
/// other participant's unread messages as read.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let requester = claims.sub;
    let messages = with_db(&state, move |db| db.list_messages(conversation_id, requester)).await?;
    Ok(Json(messages))
}

/// POST /conversations/{id}/messages: persist only. The sending client fans
/// the returned record out over the gateway.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = claims.sub;
    let message = with_db(&state, move |db| {
        db.send_message(conversation_id, sender, &req.content)
    })
    .await?;

    debug!("{} ({}) stored message {} in {}", claims.username, sender, message.id, conversation_id);
    Ok((StatusCode::CREATED, Json(message)))
}
