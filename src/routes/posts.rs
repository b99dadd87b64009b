use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::content::{render_content, serialize_content, PendingImage};
use crate::errors::{AppError, AppResult};
use crate::jwt::AuthUser;
use crate::models::category::Category;
use crate::models::post::{DbPost, DbPostAttachment, PageQuery, Post, PostAttachment};
use crate::models::user::User;
use crate::permissions::PermissionIdentifier;
use crate::routes::{categories, users};
use crate::serializer::{is_owned_by, shape, shape_many, SerializeOptions};
use crate::storage::{validate_upload, StoredFile, MAX_ATTACHMENTS_PER_POST};
use crate::utils::utc_now;

pub const ALLOWED_ITEMS_PER_PAGE: [i64; 3] = [9, 15, 30];
const DEFAULT_ITEMS_PER_PAGE: i64 = 15;
const MIN_TITLE_LENGTH: usize = 4;

#[utoipa::path(
    get,
    path = "/post",
    tag = "Posts",
    params(
        ("page" = Option<i64>, Query, description = "Zero-based page number"),
        ("items_per_page" = Option<i64>, Query, description = "One of the allowed page sizes"),
        ("category_id" = Option<Uuid>, Query, description = "Filter by category"),
        ("author_id" = Option<Uuid>, Query, description = "Filter by author")
    ),
    responses((status = 200, description = "Page of posts, newest first"))
)]
pub async fn list_posts(
    State(state): State<AppState>,
    caller: Option<AuthUser>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let items_per_page = query.items_per_page.unwrap_or(DEFAULT_ITEMS_PER_PAGE);
    if !ALLOWED_ITEMS_PER_PAGE.contains(&items_per_page) {
        return Err(AppError::validation(
            "items_per_page",
            format!("items_per_page must be one of {ALLOWED_ITEMS_PER_PAGE:?}"),
        ));
    }
    let page = query.page.unwrap_or(0);
    if page < 0 {
        return Err(AppError::validation("page", "page must not be negative"));
    }

    let mut conditions = Vec::new();
    if query.category_id.is_some() {
        conditions.push("category_id = ?");
    }
    if query.author_id.is_some() {
        conditions.push("author_id = ?");
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let list_sql = format!(
        "SELECT id, title, content, category_id, author_id, attachment_instance_count, created_at \
         FROM posts{where_clause} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
    );
    let mut list_query = sqlx::query_as::<_, DbPost>(&list_sql);
    if let Some(category_id) = query.category_id {
        list_query = list_query.bind(category_id.to_string());
    }
    if let Some(author_id) = query.author_id {
        list_query = list_query.bind(author_id.to_string());
    }
    let rows = list_query
        .bind(items_per_page)
        .bind(items_per_page * page)
        .fetch_all(&state.pool)
        .await?;

    let count_sql = format!("SELECT COUNT(1) FROM posts{where_clause}");
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(category_id) = query.category_id {
        count_query = count_query.bind(category_id.to_string());
    }
    if let Some(author_id) = query.author_id {
        count_query = count_query.bind(author_id.to_string());
    }
    let post_count = count_query.fetch_one(&state.pool).await?;

    let mut posts = Vec::with_capacity(rows.len());
    for row in rows {
        posts.push(assemble_post(&state.pool, row).await?);
    }

    let shaped_posts = shape_many(
        &posts,
        &SerializeOptions::with_permission_groups(),
        caller.as_ref(),
    )?;

    Ok(Json(json!({
        "posts": shaped_posts,
        "page": page,
        "page_count": (post_count + items_per_page - 1) / items_per_page,
        "items_per_page": items_per_page,
    })))
}

#[utoipa::path(
    get,
    path = "/post/allowed-items-per-page",
    tag = "Posts",
    responses((status = 200, description = "Allowed page sizes"))
)]
pub async fn allowed_items_per_page() -> Json<[i64; 3]> {
    Json(ALLOWED_ITEMS_PER_PAGE)
}

#[utoipa::path(
    get,
    path = "/post/{id}",
    tag = "Posts",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post with rendered content", body = Post),
        (status = 404, description = "Post not found")
    )
)]
pub async fn get_post(
    State(state): State<AppState>,
    caller: Option<AuthUser>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let post = assemble_post(&state.pool, fetch_post(&state.pool, id).await?).await?;
    let shaped = shape(
        &post,
        &SerializeOptions::with_permission_groups(),
        caller.as_ref(),
    )?;
    Ok(Json(shaped))
}

#[utoipa::path(
    post,
    path = "/post",
    tag = "Posts",
    responses(
        (status = 201, description = "Post published", body = Post),
        (status = 400, description = "Validation failed")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_post(
    State(state): State<AppState>,
    auth: AuthUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<Value>)> {
    auth.require(&state, PermissionIdentifier::CanPublishPost).await?;

    let form = read_post_form(multipart).await?;
    let title = require_title(form.title.as_deref())?;
    let content = form
        .content
        .as_deref()
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| AppError::validation("content", "content must not be empty"))?;
    let category_id = form
        .category_id
        .ok_or_else(|| AppError::validation("category_id", "category_id is required"))?;
    let _ = categories::fetch_category(&state.pool, category_id).await?;

    // New posts start their instance counter at zero.
    let serialized = serialize_content(content, 0)?;
    let stored = store_pending_images(&state, &serialized.new_images).await?;

    let post_id = Uuid::new_v4();
    let persisted = persist_new_post(
        &state.pool,
        post_id,
        &title,
        &serialized.content,
        category_id,
        auth.user_id(),
        &stored,
    )
    .await;

    if let Err(err) = persisted {
        // The rows never committed; the files written this request must go too.
        state.attachments.remove_all(&stored).await;
        return Err(err);
    }

    let post = assemble_post(&state.pool, fetch_post(&state.pool, post_id).await?).await?;
    let shaped = shape(&post, &SerializeOptions::with_permission_groups(), Some(&auth))?;

    Ok((StatusCode::CREATED, Json(shaped)))
}

#[utoipa::path(
    patch,
    path = "/post/{id}",
    tag = "Posts",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 403, description = "Not the author and no manage-any permission")
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_post(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    auth.require(&state, PermissionIdentifier::CanManageOwnPosts).await?;

    let post: Post = fetch_post(&state.pool, id).await?.try_into()?;
    ensure_can_edit(&state, &auth, &post).await?;

    let form = read_post_form(multipart).await?;
    let title = match form.title.as_deref() {
        Some(title) => require_title(Some(title))?,
        None => post.title.clone(),
    };
    // Content is the source of truth for which attachments stay referenced,
    // so an update must always carry it.
    let content = form
        .content
        .as_deref()
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| AppError::validation("content", "content must not be empty"))?;
    let category_id = match form.category_id {
        Some(category_id) => {
            let _ = categories::fetch_category(&state.pool, category_id).await?;
            category_id
        }
        None => post.category_id,
    };

    let serialized = serialize_content(content, post.attachment_instance_count)?;
    let stored = store_pending_images(&state, &serialized.new_images).await?;

    let reconciled = reconcile_attachments(
        &state.pool,
        &post,
        &title,
        &serialized.content,
        category_id,
        &serialized.referenced,
        &stored,
    )
    .await;

    let removed = match reconciled {
        Ok(removed) => removed,
        Err(err) => {
            state.attachments.remove_all(&stored).await;
            return Err(err);
        }
    };

    // Only after the commit is it safe to touch the old files. Failures are
    // logged inside remove and never surface to the caller.
    for attachment in &removed {
        state
            .attachments
            .remove(attachment.file_id, &attachment.mime_type)
            .await;
    }

    let post = assemble_post(&state.pool, fetch_post(&state.pool, id).await?).await?;
    let shaped = shape(&post, &SerializeOptions::with_permission_groups(), Some(&auth))?;
    Ok(Json(shaped))
}

#[utoipa::path(
    delete,
    path = "/post/{id}",
    tag = "Posts",
    params(("id" = Uuid, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post deleted"),
        (status = 403, description = "Not the author and no manage-any permission")
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_post(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    auth.require(&state, PermissionIdentifier::CanManageOwnPosts).await?;

    let post: Post = fetch_post(&state.pool, id).await?.try_into()?;
    ensure_can_edit(&state, &auth, &post).await?;

    let attachments = fetch_attachments(&state.pool, id).await?;

    // Attachment rows go with the post via the foreign-key cascade.
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id.to_string())
        .execute(&state.pool)
        .await?;

    for attachment in &attachments {
        state
            .attachments
            .remove(attachment.file_id, &attachment.mime_type)
            .await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Author edits their own post; anyone else needs the manage-any grant.
async fn ensure_can_edit(state: &AppState, auth: &AuthUser, post: &Post) -> AppResult<()> {
    if is_owned_by(post, auth.user_id()) {
        return Ok(());
    }
    auth.require(state, PermissionIdentifier::CanManageAnyPosts).await
}

#[derive(Debug, Default)]
struct PostForm {
    title: Option<String>,
    content: Option<String>,
    category_id: Option<Uuid>,
}

async fn read_post_form(mut multipart: Multipart) -> AppResult<PostForm> {
    let mut form = PostForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let text = field
            .text()
            .await
            .map_err(|err| AppError::bad_request(format!("malformed multipart field: {err}")))?;

        match name.as_str() {
            "title" => form.title = Some(text),
            "content" => form.content = Some(text),
            "category_id" => {
                let id = Uuid::parse_str(text.trim()).map_err(|_| {
                    AppError::validation("category_id", "category_id must be a valid uuid")
                })?;
                form.category_id = Some(id);
            }
            _ => {}
        }
    }

    Ok(form)
}

fn require_title(title: Option<&str>) -> AppResult<String> {
    let title = title.map(str::trim).unwrap_or_default();
    if title.chars().count() < MIN_TITLE_LENGTH {
        return Err(AppError::validation("title", "title is too short"));
    }
    Ok(title.to_string())
}

/// Validate every pending image before any of them touch the disk, then
/// write them in order. A failed write rolls back the files already written
/// in this request.
async fn store_pending_images(state: &AppState, images: &[PendingImage]) -> AppResult<Vec<StoredFile>> {
    if images.len() > MAX_ATTACHMENTS_PER_POST {
        return Err(AppError::validation(
            "content",
            format!("a post can embed at most {MAX_ATTACHMENTS_PER_POST} images"),
        ));
    }
    for image in images {
        validate_upload(&image.mime_type, image.data.len())?;
    }

    let mut stored = Vec::with_capacity(images.len());
    for image in images {
        match state.attachments.save(&image.mime_type, &image.data).await {
            Ok(file) => stored.push(file),
            Err(err) => {
                state.attachments.remove_all(&stored).await;
                return Err(err);
            }
        }
    }

    Ok(stored)
}

/// Create path of the attachment lifecycle: post row and attachment rows
/// with instance ids 0..n, all in one transaction.
async fn persist_new_post(
    pool: &SqlitePool,
    post_id: Uuid,
    title: &str,
    content: &str,
    category_id: Uuid,
    author_id: Uuid,
    stored: &[StoredFile],
) -> AppResult<()> {
    let now = utc_now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO posts (id, title, content, category_id, author_id, attachment_instance_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(post_id.to_string())
    .bind(title)
    .bind(content)
    .bind(category_id.to_string())
    .bind(author_id.to_string())
    .bind(stored.len() as i64)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for (index, file) in stored.iter().enumerate() {
        sqlx::query(
            "INSERT INTO post_attachments (file_id, mime_type, instance_id, post_id) VALUES (?, ?, ?, ?)",
        )
        .bind(file.file_id.to_string())
        .bind(&file.mime_type)
        .bind(index as i64)
        .bind(post_id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Update path of the attachment lifecycle, one transaction: rows whose
/// instance id is no longer referenced are deleted, new files get ids
/// continuing from the counter (freed ids are never reused), then the post
/// row itself is updated. Returns the removed rows so the caller can delete
/// their files after the commit.
async fn reconcile_attachments(
    pool: &SqlitePool,
    post: &Post,
    title: &str,
    content: &str,
    category_id: Uuid,
    referenced: &[i64],
    stored: &[StoredFile],
) -> AppResult<Vec<PostAttachment>> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, DbPostAttachment>(
        "SELECT file_id, mime_type, instance_id, post_id FROM post_attachments WHERE post_id = ?",
    )
    .bind(post.id.to_string())
    .fetch_all(&mut *tx)
    .await?;

    let removed: Vec<PostAttachment> = current
        .into_iter()
        .filter(|attachment| !referenced.contains(&attachment.instance_id))
        .map(PostAttachment::try_from)
        .collect::<Result<_, _>>()?;

    for attachment in &removed {
        sqlx::query("DELETE FROM post_attachments WHERE post_id = ? AND instance_id = ?")
            .bind(post.id.to_string())
            .bind(attachment.instance_id)
            .execute(&mut *tx)
            .await?;
    }

    for (index, file) in stored.iter().enumerate() {
        sqlx::query(
            "INSERT INTO post_attachments (file_id, mime_type, instance_id, post_id) VALUES (?, ?, ?, ?)",
        )
        .bind(file.file_id.to_string())
        .bind(&file.mime_type)
        .bind(post.attachment_instance_count + index as i64)
        .bind(post.id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE posts SET title = ?, content = ?, category_id = ?, attachment_instance_count = ? WHERE id = ?",
    )
    .bind(title)
    .bind(content)
    .bind(category_id.to_string())
    .bind(post.attachment_instance_count + stored.len() as i64)
    .bind(post.id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(removed)
}

async fn assemble_post(pool: &SqlitePool, row: DbPost) -> AppResult<Post> {
    let mut post: Post = row.try_into()?;

    let author: User = users::fetch_user(pool, post.author_id).await?.try_into()?;
    let category: Category = categories::fetch_category(pool, post.category_id)
        .await?
        .try_into()?;
    let attachments = fetch_attachments(pool, post.id).await?;

    post.content = render_content(&post.content, &attachments);
    post.author = Some(author);
    post.category = Some(category);
    post.attachments = attachments;

    Ok(post)
}

async fn fetch_post(pool: &SqlitePool, id: Uuid) -> AppResult<DbPost> {
    sqlx::query_as::<_, DbPost>(
        "SELECT id, title, content, category_id, author_id, attachment_instance_count, created_at \
         FROM posts WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("post not found"))
}

async fn fetch_attachments(pool: &SqlitePool, post_id: Uuid) -> AppResult<Vec<PostAttachment>> {
    let rows = sqlx::query_as::<_, DbPostAttachment>(
        "SELECT file_id, mime_type, instance_id, post_id FROM post_attachments WHERE post_id = ? ORDER BY instance_id",
    )
    .bind(post_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(PostAttachment::try_from).collect()
}
