use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::permission::{
    DbPermission, Permission, PermissionCreateRequest, PermissionUpdateRequest,
};
use crate::permissions::PermissionIdentifier;
use crate::serializer::{shape, shape_many, SerializeOptions};

#[utoipa::path(
    get,
    path = "/permission",
    tag = "Permissions",
    responses((status = 200, description = "List permissions", body = [Permission])),
    security(("bearerAuth" = []))
)]
pub async fn list_permissions(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManagePermissions).await?;

    let rows = sqlx::query_as::<_, DbPermission>(
        "SELECT id, identifier, description FROM permissions ORDER BY identifier",
    )
    .fetch_all(&state.pool)
    .await?;

    let permissions: Vec<Permission> = rows
        .into_iter()
        .map(Permission::try_from)
        .collect::<Result<_, _>>()?;

    let shaped = shape_many(&permissions, &SerializeOptions::default(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    get,
    path = "/permission/{id}",
    tag = "Permissions",
    params(("id" = Uuid, Path, description = "Permission id")),
    responses((status = 200, description = "Permission detail", body = Permission)),
    security(("bearerAuth" = []))
)]
pub async fn get_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManagePermissions).await?;

    let permission: Permission = fetch_permission(&state.pool, id).await?.try_into()?;
    let shaped = shape(&permission, &SerializeOptions::default(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    post,
    path = "/permission",
    tag = "Permissions",
    request_body = PermissionCreateRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 409, description = "Identifier already exists")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<PermissionCreateRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    auth.require(&state, PermissionIdentifier::CanManagePermissions).await?;
    payload.validate()?;

    let id = Uuid::new_v4();

    sqlx::query("INSERT INTO permissions (id, identifier, description) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(&payload.identifier)
        .bind(&payload.description)
        .execute(&state.pool)
        .await
        .map_err(|err| {
            AppError::conflict_on_unique(
                err,
                format!("permission {} already exists", payload.identifier),
            )
        })?;

    let permission: Permission = fetch_permission(&state.pool, id).await?.try_into()?;
    let shaped = shape(&permission, &SerializeOptions::default(), Some(&auth))?;

    Ok((StatusCode::CREATED, Json(shaped)))
}

#[utoipa::path(
    patch,
    path = "/permission/{id}",
    tag = "Permissions",
    params(("id" = Uuid, Path, description = "Permission id")),
    request_body = PermissionUpdateRequest,
    responses((status = 200, description = "Permission updated", body = Permission)),
    security(("bearerAuth" = []))
)]
pub async fn update_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<PermissionUpdateRequest>,
) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManagePermissions).await?;

    let mut permission = fetch_permission(&state.pool, id).await?;
    permission.description = payload.description;

    sqlx::query("UPDATE permissions SET description = ? WHERE id = ?")
        .bind(&permission.description)
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;

    let permission: Permission = permission.try_into()?;
    let shaped = shape(&permission, &SerializeOptions::default(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    delete,
    path = "/permission/{id}",
    tag = "Permissions",
    params(("id" = Uuid, Path, description = "Permission id")),
    responses((status = 204, description = "Permission deleted")),
    security(("bearerAuth" = []))
)]
pub async fn delete_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    auth.require(&state, PermissionIdentifier::CanManagePermissions).await?;

    let _ = fetch_permission(&state.pool, id).await?;

    sqlx::query("DELETE FROM permissions WHERE id = ?")
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_permission(pool: &SqlitePool, id: Uuid) -> AppResult<DbPermission> {
    sqlx::query_as::<_, DbPermission>(
        "SELECT id, identifier, description FROM permissions WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("permission not found"))
}
