use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;

use swapmeet_types::api::{Claims, CreateConversationRequest};

use crate::auth::AppState;
use crate::error::{ApiError, with_db};

/// GET /conversations: the caller's inbox, newest activity first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let previews = with_db(&state, move |db| db.list_conversations_for_user(user_id)).await?;
    Ok(Json(previews))
}

/// POST /conversations: find or start the conversation with `userId`.
/// 201 when this request created it, 200 when it already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = claims.sub;
    let (conversation, created) = with_db(&state, move |db| {
        db.get_or_create_conversation(caller, req.user_id)
    })
    .await?;

    let status = if created {
        info!("{} ({}) started conversation {}", claims.username, caller, conversation.id);
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}
