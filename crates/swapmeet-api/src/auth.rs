use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use swapmeet_db::Database;
use swapmeet_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use swapmeet_types::error::ErrorKind;

use crate::error::{ApiError, with_db};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::new(
            ErrorKind::InvalidArgument,
            "username must be 3-32 characters",
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::new(
            ErrorKind::InvalidArgument,
            "password must be at least 8 characters",
        ));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| ApiError::internal())?
        .to_string();

    let user_id = Uuid::new_v4();
    let username = req.username.clone();
    let taken = with_db(&state, move |db| {
        if db.get_user_by_username(&req.username)?.is_some() {
            return Ok(true);
        }
        db.create_user(
            user_id,
            &req.username,
            &password_hash,
            req.display_name.as_deref(),
            req.team,
        )?;
        Ok(false)
    })
    .await?;

    if taken {
        return Err(
            ApiError::new(ErrorKind::InvalidArgument, "username is taken")
                .with_status(StatusCode::CONFLICT),
        );
    }

    let token = create_token(&state.jwt_secret, user_id, &username).map_err(|_| ApiError::internal())?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.clone();
    let user = with_db(&state, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(ApiError::unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password).map_err(|_| ApiError::internal())?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::unauthorized())?;

    let user_id: Uuid = user.id.parse().map_err(|_| ApiError::internal())?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)
        .map_err(|_| ApiError::internal())?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
