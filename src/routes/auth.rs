use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::jwt::{AuthUser, AUTH_COOKIE};
use crate::models::user::{DbUser, LoginRequest, User};
use crate::permissions;
use crate::serializer::{shape, SerializeOptions};
use crate::utils::verify_password;

#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful; token also set as an httpOnly cookie"),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<Value>)> {
    let db_user = find_by_email(&state.pool, &payload.email)
        .await?
        .ok_or_else(|| AppError::unauthorized("invalid email or password"))?;

    if !verify_password(&payload.password, &db_user.password_hash)? {
        return Err(AppError::unauthorized("invalid email or password"));
    }

    let mut user: User = db_user.try_into()?;
    let identifiers = permissions::identifiers_for_user(&state.pool, user.id).await?;
    user.permissions = Some(identifiers.clone());

    let token = state.jwt.encode(user.id)?;

    let caller = AuthUser {
        user: user.clone(),
        permissions: identifiers.into_iter().collect(),
    };
    let shaped_user = shape(&user, &SerializeOptions::with_permission_groups(), Some(&caller))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        auth_cookie(&token, state.jwt.cookie_max_age_seconds())
            .parse()
            .map_err(|_| AppError::internal("invalid cookie value"))?,
    );

    Ok((headers, Json(json!({ "token": token, "user": shaped_user }))))
}

#[utoipa::path(
    get,
    path = "/auth",
    tag = "Auth",
    responses((status = 200, description = "Current authenticated user", body = User)),
    security(("bearerAuth" = []))
)]
pub async fn current_user(auth: AuthUser) -> AppResult<Json<Value>> {
    let shaped = shape(
        &auth.user,
        &SerializeOptions::with_permission_groups(),
        Some(&auth),
    )?;
    Ok(Json(shaped))
}

#[utoipa::path(
    get,
    path = "/auth/signout",
    tag = "Auth",
    responses((status = 200, description = "Cookie cleared")),
    security(("bearerAuth" = []))
)]
pub async fn signout(_auth: AuthUser) -> AppResult<(HeaderMap, Json<Value>)> {
    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        auth_cookie("", 0)
            .parse()
            .map_err(|_| AppError::internal("invalid cookie value"))?,
    );

    Ok((headers, Json(json!({ "message": "signed out" }))))
}

fn auth_cookie(token: &str, max_age_seconds: i64) -> String {
    format!("{AUTH_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}")
}

async fn find_by_email(pool: &SqlitePool, email: &str) -> AppResult<Option<DbUser>> {
    let user = sqlx::query_as::<_, DbUser>(
        "SELECT id, email, first_name, last_name, password_hash, created_at FROM users WHERE email = ?",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}
