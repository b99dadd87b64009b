use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::category::Category;
use crate::models::user::{parse_row_uuid, User};
use crate::serializer::{FieldRule, HasOwner, Shaped};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Uuid,
    pub title: String,
    /// Sanitized HTML. Stored form carries attachment-instanceid markers;
    /// responses carry the rendered form with resolved image sources.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub category_id: Uuid,
    pub author_id: Uuid,
    /// Running counter used to assign attachment instance ids. Never
    /// decreases, even when attachments are removed.
    pub attachment_instance_count: i64,
    pub category: Option<Category>,
    pub author: Option<User>,
    pub attachments: Vec<PostAttachment>,
}

static POST_RULES: &[FieldRule] = &[
    FieldRule::always("id"),
    FieldRule::always("title"),
    FieldRule::always("content"),
    FieldRule::always("created_at"),
    FieldRule::always("category_id"),
    FieldRule::always("author_id"),
    FieldRule::always("attachment_instance_count"),
    FieldRule::always("category")
        .exclude_if_null()
        .nested(Category::visibility),
    FieldRule::always("author").exclude_if_null().nested(User::visibility),
    FieldRule::always("attachments").nested(PostAttachment::visibility),
];

impl Shaped for Post {
    fn visibility() -> &'static [FieldRule] {
        POST_RULES
    }

    fn owner(&self) -> Option<Uuid> {
        Some(self.owner_id())
    }
}

impl HasOwner for Post {
    fn owner_id(&self) -> Uuid {
        self.author_id
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPost {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category_id: String,
    pub author_id: String,
    pub attachment_instance_count: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbPost> for Post {
    type Error = AppError;

    fn try_from(value: DbPost) -> Result<Self, Self::Error> {
        Ok(Post {
            id: parse_row_uuid(&value.id)?,
            title: value.title,
            content: value.content,
            created_at: value.created_at,
            category_id: parse_row_uuid(&value.category_id)?,
            author_id: parse_row_uuid(&value.author_id)?,
            attachment_instance_count: value.attachment_instance_count,
            category: None,
            author: None,
            attachments: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostAttachment {
    /// Also the on-disk filename stem.
    pub file_id: Uuid,
    pub mime_type: String,
    /// Per-post sequence number referenced from content markers. Stable
    /// across edits, unique within a post.
    pub instance_id: i64,
    pub post_id: Uuid,
}

static ATTACHMENT_RULES: &[FieldRule] = &[
    FieldRule::always("file_id"),
    FieldRule::always("mime_type"),
    FieldRule::always("instance_id"),
    FieldRule::always("post_id"),
];

impl Shaped for PostAttachment {
    fn visibility() -> &'static [FieldRule] {
        ATTACHMENT_RULES
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPostAttachment {
    pub file_id: String,
    pub mime_type: String,
    pub instance_id: i64,
    pub post_id: String,
}

impl TryFrom<DbPostAttachment> for PostAttachment {
    type Error = AppError;

    fn try_from(value: DbPostAttachment) -> Result<Self, Self::Error> {
        Ok(PostAttachment {
            file_id: parse_row_uuid(&value.file_id)?,
            mime_type: value.mime_type,
            instance_id: value.instance_id,
            post_id: parse_row_uuid(&value.post_id)?,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub items_per_page: Option<i64>,
    pub category_id: Option<Uuid>,
    pub author_id: Option<Uuid>,
}
