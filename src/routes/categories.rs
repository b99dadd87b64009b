use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::category::{Category, CategoryCreateRequest, CategoryUpdateRequest, DbCategory};
use crate::models::post::DbPostAttachment;
use crate::permissions::PermissionIdentifier;
use crate::serializer::{shape, shape_many, SerializeOptions};
use crate::utils::utc_now;

#[utoipa::path(
    get,
    path = "/category",
    tag = "Categories",
    responses((status = 200, description = "List categories", body = [Category]))
)]
pub async fn list_categories(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let rows = sqlx::query_as::<_, DbCategory>(
        "SELECT id, name, description, color, created_at FROM categories ORDER BY name",
    )
    .fetch_all(&state.pool)
    .await?;

    let categories: Vec<Category> = rows
        .into_iter()
        .map(Category::try_from)
        .collect::<Result<_, _>>()?;

    let shaped = shape_many(&categories, &SerializeOptions::default(), None)?;
    Ok(Json(shaped))
}

#[utoipa::path(
    get,
    path = "/category/{id}",
    tag = "Categories",
    params(("id" = Uuid, Path, description = "Category id")),
    responses((status = 200, description = "Category detail", body = Category))
)]
pub async fn get_category(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let category: Category = fetch_category(&state.pool, id).await?.try_into()?;
    let shaped = shape(&category, &SerializeOptions::default(), None)?;
    Ok(Json(shaped))
}

#[utoipa::path(
    post,
    path = "/category",
    tag = "Categories",
    request_body = CategoryCreateRequest,
    responses(
        (status = 201, description = "Category created", body = Category),
        (status = 409, description = "Category name already exists")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_category(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CategoryCreateRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    auth.require(&state, PermissionIdentifier::CanManageCategories).await?;
    payload.validate()?;

    let name = payload.name.trim().to_string();
    ensure_name_available(&state.pool, &name, None).await?;

    let id = Uuid::new_v4();
    let now = utc_now();

    sqlx::query(
        "INSERT INTO categories (id, name, description, color, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(&name)
    .bind(&payload.description)
    .bind(&payload.color)
    .bind(now)
    .execute(&state.pool)
    .await
    .map_err(|err| {
        AppError::conflict_on_unique(err, format!("a category named \"{name}\" already exists"))
    })?;

    let category: Category = fetch_category(&state.pool, id).await?.try_into()?;
    let shaped = shape(&category, &SerializeOptions::default(), Some(&auth))?;

    Ok((StatusCode::CREATED, Json(shaped)))
}

#[utoipa::path(
    patch,
    path = "/category/{id}",
    tag = "Categories",
    params(("id" = Uuid, Path, description = "Category id")),
    request_body = CategoryUpdateRequest,
    responses(
        (status = 200, description = "Category updated", body = Category),
        (status = 409, description = "Category name already exists")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_category(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CategoryUpdateRequest>,
) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManageCategories).await?;
    payload.validate()?;

    let mut category = fetch_category(&state.pool, id).await?;

    if let Some(name) = payload.name.as_deref() {
        let name = name.trim().to_string();
        if name != category.name {
            ensure_name_available(&state.pool, &name, Some(id)).await?;
        }
        category.name = name;
    }
    if payload.description.is_some() {
        category.description = payload.description.clone();
    }
    if let Some(color) = payload.color.as_deref() {
        category.color = color.to_string();
    }

    sqlx::query("UPDATE categories SET name = ?, description = ?, color = ? WHERE id = ?")
        .bind(&category.name)
        .bind(&category.description)
        .bind(&category.color)
        .bind(id.to_string())
        .execute(&state.pool)
        .await
        .map_err(|err| AppError::conflict_on_unique(err, "category name already exists"))?;

    let category: Category = category.try_into()?;
    let shaped = shape(&category, &SerializeOptions::default(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    delete,
    path = "/category/{id}",
    tag = "Categories",
    params(("id" = Uuid, Path, description = "Category id")),
    responses((status = 204, description = "Category and its posts deleted")),
    security(("bearerAuth" = []))
)]
pub async fn delete_category(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    auth.require(&state, PermissionIdentifier::CanManageCategories).await?;

    let _ = fetch_category(&state.pool, id).await?;

    // The row cascade takes posts and attachment rows with it; their files
    // are only removable after the delete commits, so collect them first.
    let orphaned = sqlx::query_as::<_, DbPostAttachment>(
        r#"
        SELECT pa.file_id, pa.mime_type, pa.instance_id, pa.post_id
        FROM post_attachments pa
        INNER JOIN posts p ON p.id = pa.post_id
        WHERE p.category_id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_all(&state.pool)
    .await?;

    sqlx::query("DELETE FROM categories WHERE id = ?")
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;

    for attachment in orphaned {
        let parsed: AppResult<crate::models::post::PostAttachment> = attachment.try_into();
        match parsed {
            Ok(attachment) => {
                state
                    .attachments
                    .remove(attachment.file_id, &attachment.mime_type)
                    .await
            }
            Err(err) => tracing::error!(error = %err, "skipping cleanup of corrupt attachment row"),
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn fetch_category(pool: &SqlitePool, id: Uuid) -> AppResult<DbCategory> {
    sqlx::query_as::<_, DbCategory>(
        "SELECT id, name, description, color, created_at FROM categories WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("category not found"))
}

async fn ensure_name_available(pool: &SqlitePool, name: &str, exclude: Option<Uuid>) -> AppResult<()> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM categories WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    if let Some(id) = existing {
        let excluded = exclude.map(|u| u.to_string());
        if excluded.as_deref() != Some(id.as_str()) {
            return Err(AppError::conflict(format!(
                "a category named \"{name}\" already exists"
            )));
        }
    }

    Ok(())
}
