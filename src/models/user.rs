use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, AppResult, FieldErrors};
use crate::permissions::PermissionIdentifier;
use crate::serializer::{FieldRule, HasOwner, Shaped, OWNER_GROUP};
use crate::utils::{is_valid_email, password_strength_error, person_name_error};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    /// Granted permission identifiers; None when not loaded for this response.
    pub permissions: Option<Vec<String>>,
}

const CREATED_AT_GROUPS: &[&str] = &[
    PermissionIdentifier::CanManageUsers.as_str(),
    OWNER_GROUP,
];
const PERMISSION_LIST_GROUPS: &[&str] = &[
    PermissionIdentifier::CanManagePermissions.as_str(),
    OWNER_GROUP,
];

static USER_RULES: &[FieldRule] = &[
    FieldRule::always("id"),
    FieldRule::always("email"),
    FieldRule::always("first_name"),
    FieldRule::always("last_name"),
    FieldRule::grouped("created_at", CREATED_AT_GROUPS),
    FieldRule::grouped("permissions", PERMISSION_LIST_GROUPS).exclude_if_null(),
];

impl Shaped for User {
    fn visibility() -> &'static [FieldRule] {
        USER_RULES
    }

    fn owner(&self) -> Option<Uuid> {
        Some(self.owner_id())
    }
}

impl HasOwner for User {
    fn owner_id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbUser {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbUser> for User {
    type Error = AppError;

    fn try_from(value: DbUser) -> Result<Self, Self::Error> {
        Ok(User {
            id: parse_row_uuid(&value.id)?,
            email: value.email,
            first_name: value.first_name,
            last_name: value.last_name,
            created_at: value.created_at,
            permissions: None,
        })
    }
}

pub(crate) fn parse_row_uuid(value: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| AppError::internal(format!("corrupt row id: {err}")))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UserCreateRequest {
    #[schema(example = "ada@example.com")]
    pub email: String,
    #[schema(example = "Ada")]
    pub first_name: String,
    #[schema(example = "Lovelace")]
    pub last_name: String,
    #[schema(example = "S3cureP@ssw0rd")]
    pub password: String,
}

impl UserCreateRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut fields = FieldErrors::new();

        if !is_valid_email(self.email.trim()) {
            fields.insert("email".to_string(), "invalid email address".to_string());
        }
        if let Some(message) = person_name_error(self.first_name.trim()) {
            fields.insert("first_name".to_string(), message.to_string());
        }
        if let Some(message) = person_name_error(self.last_name.trim()) {
            fields.insert("last_name".to_string(), message.to_string());
        }
        if let Some(message) = password_strength_error(&self.password) {
            fields.insert("password".to_string(), message.to_string());
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(fields))
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UserUpdateRequest {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: Option<String>,
}

impl UserUpdateRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut fields = FieldErrors::new();

        if let Some(email) = self.email.as_deref() {
            if !is_valid_email(email.trim()) {
                fields.insert("email".to_string(), "invalid email address".to_string());
            }
        }
        if let Some(name) = self.first_name.as_deref() {
            if let Some(message) = person_name_error(name.trim()) {
                fields.insert("first_name".to_string(), message.to_string());
            }
        }
        if let Some(name) = self.last_name.as_deref() {
            if let Some(message) = person_name_error(name.trim()) {
                fields.insert("last_name".to_string(), message.to_string());
            }
        }
        if let Some(password) = self.password.as_deref() {
            if let Some(message) = password_strength_error(password) {
                fields.insert("password".to_string(), message.to_string());
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(fields))
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateUserPermissionsRequest {
    /// Full replacement set of permission identifiers.
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    #[schema(example = "ada@example.com")]
    pub email: String,
    #[schema(example = "S3cureP@ssw0rd")]
    pub password: String,
}
