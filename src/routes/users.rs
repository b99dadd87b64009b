use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::user::{
    DbUser, UpdateUserPermissionsRequest, User, UserCreateRequest, UserUpdateRequest,
};
use crate::permissions::{self, PermissionIdentifier};
use crate::serializer::{shape, shape_many, SerializeOptions};
use crate::utils::{hash_password, utc_now};

#[utoipa::path(
    post,
    path = "/user",
    tag = "Users",
    request_body = UserCreateRequest,
    responses(
        (status = 201, description = "User created", body = User),
        (status = 409, description = "Email already in use")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<UserCreateRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    auth.require(&state, PermissionIdentifier::CanManageUsers).await?;
    payload.validate()?;

    let email = payload.email.trim().to_lowercase();
    ensure_email_available(&state.pool, &email, None).await?;

    let password_hash = hash_password(&payload.password)?;
    let user_id = Uuid::new_v4();
    let now = utc_now();

    sqlx::query(
        "INSERT INTO users (id, email, first_name, last_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(&email)
    .bind(payload.first_name.trim())
    .bind(payload.last_name.trim())
    .bind(password_hash)
    .bind(now)
    .execute(&state.pool)
    .await
    .map_err(|err| AppError::conflict_on_unique(err, format!("the email {email} is not available")))?;

    let user: User = fetch_user(&state.pool, user_id).await?.try_into()?;
    let shaped = shape(&user, &SerializeOptions::with_permission_groups(), Some(&auth))?;

    Ok((StatusCode::CREATED, Json(shaped)))
}

#[utoipa::path(
    get,
    path = "/user",
    tag = "Users",
    responses((status = 200, description = "List users", body = [User])),
    security(("bearerAuth" = []))
)]
pub async fn list_users(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManageUsers).await?;

    let rows = sqlx::query_as::<_, DbUser>(
        "SELECT id, email, first_name, last_name, password_hash, created_at FROM users ORDER BY created_at",
    )
    .fetch_all(&state.pool)
    .await?;

    let users: Vec<User> = rows
        .into_iter()
        .map(User::try_from)
        .collect::<Result<_, _>>()?;

    let shaped = shape_many(&users, &SerializeOptions::with_permission_groups(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    get,
    path = "/user/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User detail", body = User),
        (status = 403, description = "Not allowed to view this user")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    if !can_access_user(&auth, id) {
        return Err(AppError::forbidden("you do not have access to this user"));
    }

    let mut user: User = fetch_user(&state.pool, id).await?.try_into()?;
    user.permissions = Some(permissions::identifiers_for_user(&state.pool, id).await?);

    let shaped = shape(&user, &SerializeOptions::with_permission_groups(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    patch,
    path = "/user/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UserUpdateRequest,
    responses(
        (status = 200, description = "User updated", body = User),
        (status = 409, description = "Email already in use")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UserUpdateRequest>,
) -> AppResult<Json<Value>> {
    if !can_access_user(&auth, id) {
        return Err(AppError::forbidden("you do not have permission to edit this user"));
    }
    payload.validate()?;

    let mut db_user = fetch_user(&state.pool, id).await?;

    if let Some(email) = payload.email.as_deref() {
        let email = email.trim().to_lowercase();
        if email != db_user.email {
            ensure_email_available(&state.pool, &email, Some(id)).await?;
        }
        db_user.email = email;
    }
    if let Some(first_name) = payload.first_name.as_deref() {
        db_user.first_name = first_name.trim().to_string();
    }
    if let Some(last_name) = payload.last_name.as_deref() {
        db_user.last_name = last_name.trim().to_string();
    }
    if let Some(password) = payload.password.as_deref() {
        db_user.password_hash = hash_password(password)?;
    }

    sqlx::query(
        "UPDATE users SET email = ?, first_name = ?, last_name = ?, password_hash = ? WHERE id = ?",
    )
    .bind(&db_user.email)
    .bind(&db_user.first_name)
    .bind(&db_user.last_name)
    .bind(&db_user.password_hash)
    .bind(id.to_string())
    .execute(&state.pool)
    .await
    .map_err(|err| AppError::conflict_on_unique(err, "email already in use"))?;

    let user: User = db_user.try_into()?;
    let shaped = shape(&user, &SerializeOptions::with_permission_groups(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    delete,
    path = "/user/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 204, description = "User deleted"),
        (status = 403, description = "Cannot delete own account")
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    auth.require(&state, PermissionIdentifier::CanManageUsers).await?;

    if id == auth.user_id() {
        return Err(AppError::forbidden("you cannot delete your own account"));
    }

    let _ = fetch_user(&state.pool, id).await?;

    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/user/permission/{id}",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    responses((status = 200, description = "Permission identifiers granted to the user")),
    security(("bearerAuth" = []))
)]
pub async fn get_user_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<String>>> {
    auth.require(&state, PermissionIdentifier::CanManageUserPermissions).await?;

    let _ = fetch_user(&state.pool, id).await?;
    let identifiers = permissions::identifiers_for_user(&state.pool, id).await?;

    Ok(Json(identifiers))
}

#[utoipa::path(
    patch,
    path = "/user/{id}/permissions",
    tag = "Users",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateUserPermissionsRequest,
    responses((status = 200, description = "Permission set replaced")),
    security(("bearerAuth" = []))
)]
pub async fn update_user_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUserPermissionsRequest>,
) -> AppResult<StatusCode> {
    auth.require(&state, PermissionIdentifier::CanManageUserPermissions).await?;

    let _ = fetch_user(&state.pool, id).await?;

    // Resolve identifiers to rows first; enum identifiers materialize
    // lazily, anything else must already exist.
    let mut permission_ids = Vec::with_capacity(payload.permissions.len());
    for identifier in &payload.permissions {
        let permission = match PermissionIdentifier::parse(identifier) {
            Some(known) => state.registry.resolve(&state.pool, known).await?,
            None => permissions::find_by_identifier(&state.pool, identifier)
                .await?
                .ok_or_else(|| {
                    AppError::validation("permissions", format!("unknown permission {identifier}"))
                })?,
        };
        permission_ids.push(permission.id);
    }

    // Full replacement is atomic: remove everything, insert the new set.
    let mut tx = state.pool.begin().await?;

    sqlx::query("DELETE FROM user_permissions WHERE user_id = ?")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    let now = utc_now();
    for permission_id in permission_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO user_permissions (user_id, permission_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(permission_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(StatusCode::OK)
}

fn can_access_user(auth: &AuthUser, target: Uuid) -> bool {
    auth.user_id() == target
        || auth.has(PermissionIdentifier::CanManageUsers)
        || auth.has(PermissionIdentifier::CanManageUserPermissions)
}

pub(crate) async fn fetch_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<DbUser> {
    sqlx::query_as::<_, DbUser>(
        "SELECT id, email, first_name, last_name, password_hash, created_at FROM users WHERE id = ?",
    )
    .bind(user_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("user not found"))
}

async fn ensure_email_available(
    pool: &SqlitePool,
    email: &str,
    exclude: Option<Uuid>,
) -> AppResult<()> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    if let Some(id) = existing {
        let excluded = exclude.map(|u| u.to_string());
        if excluded.as_deref() != Some(id.as_str()) {
            return Err(AppError::conflict(format!("the email {email} is not available")));
        }
    }

    Ok(())
}
