//! Permission identifiers and the lazily populated permission registry.
//!
//! Identifiers are a closed set known at compile time. Their backing rows
//! are materialized in storage on first resolution and cached for the
//! lifetime of the process; identifiers never change after deploy, so the
//! cache is never invalidated.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::permission::{DbPermission, Permission};

/// Shape every stored identifier must match, including ones created through
/// the management API.
pub static IDENTIFIER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_]{3,64}$").expect("identifier regex must compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionIdentifier {
    CanManagePermissions,
    CanManageUserPermissions,
    CanManageUsers,
    CanManageCategories,
    CanPublishPost,
    CanManageOwnPosts,
    CanManageAnyPosts,
}

impl PermissionIdentifier {
    pub const ALL: [PermissionIdentifier; 7] = [
        PermissionIdentifier::CanManagePermissions,
        PermissionIdentifier::CanManageUserPermissions,
        PermissionIdentifier::CanManageUsers,
        PermissionIdentifier::CanManageCategories,
        PermissionIdentifier::CanPublishPost,
        PermissionIdentifier::CanManageOwnPosts,
        PermissionIdentifier::CanManageAnyPosts,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            PermissionIdentifier::CanManagePermissions => "CAN_MANAGE_PERMISSIONS",
            PermissionIdentifier::CanManageUserPermissions => "CAN_MANAGE_USER_PERMISSIONS",
            PermissionIdentifier::CanManageUsers => "CAN_MANAGE_USERS",
            PermissionIdentifier::CanManageCategories => "CAN_MANAGE_CATEGORIES",
            PermissionIdentifier::CanPublishPost => "CAN_PUBLISH_POST",
            PermissionIdentifier::CanManageOwnPosts => "CAN_MANAGE_OWN_POSTS",
            PermissionIdentifier::CanManageAnyPosts => "CAN_MANAGE_ANY_POSTS",
        }
    }

    /// Serialization group tag unlocked by holding this permission. Groups
    /// map 1:1 onto identifiers.
    pub const fn group(&self) -> &'static str {
        self.as_str()
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.as_str() == value)
    }
}

impl std::fmt::Display for PermissionIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-lifetime cache of permission rows keyed by identifier.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    cache: RwLock<HashMap<&'static str, Permission>>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an identifier to its stored permission row, creating the row
    /// the first time it is seen.
    pub async fn resolve(
        &self,
        pool: &SqlitePool,
        identifier: PermissionIdentifier,
    ) -> AppResult<Permission> {
        if let Some(permission) = self.cache.read().await.get(identifier.as_str()) {
            return Ok(permission.clone());
        }

        let permission = find_or_create(pool, identifier.as_str()).await?;
        self.cache
            .write()
            .await
            .insert(identifier.as_str(), permission.clone());

        Ok(permission)
    }
}

async fn find_or_create(pool: &SqlitePool, identifier: &str) -> AppResult<Permission> {
    if let Some(existing) = find_by_identifier(pool, identifier).await? {
        return Ok(existing);
    }

    let id = Uuid::new_v4();
    let insert = sqlx::query(
        "INSERT INTO permissions (id, identifier, description) VALUES (?, ?, NULL)",
    )
    .bind(id.to_string())
    .bind(identifier)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {}
        // Lost a race against a concurrent first resolution; the row exists now.
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {}
        Err(err) => return Err(err.into()),
    }

    find_by_identifier(pool, identifier)
        .await?
        .ok_or_else(|| AppError::not_found(format!("permission {identifier} not found")))
}

pub async fn find_by_identifier(
    pool: &SqlitePool,
    identifier: &str,
) -> AppResult<Option<Permission>> {
    let row = sqlx::query_as::<_, DbPermission>(
        "SELECT id, identifier, description FROM permissions WHERE identifier = ?",
    )
    .bind(identifier)
    .fetch_optional(pool)
    .await?;

    row.map(Permission::try_from).transpose()
}

/// Identifiers granted to a user, newest grant set wins. Unknown custom
/// identifiers granted through the management API are carried verbatim.
pub async fn identifiers_for_user(pool: &SqlitePool, user_id: Uuid) -> AppResult<Vec<String>> {
    let identifiers: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT p.identifier
        FROM permissions p
        INNER JOIN user_permissions up ON p.id = up.permission_id
        WHERE up.user_id = ?
        ORDER BY p.identifier
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(identifiers)
}
