use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::user::parse_row_uuid;
use crate::permissions::IDENTIFIER_REGEX;
use crate::serializer::{FieldRule, Shaped};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub id: Uuid,
    pub identifier: String,
    pub description: Option<String>,
}

static PERMISSION_RULES: &[FieldRule] = &[
    FieldRule::always("id"),
    FieldRule::always("identifier"),
    FieldRule::always("description").exclude_if_null(),
];

impl Shaped for Permission {
    fn visibility() -> &'static [FieldRule] {
        PERMISSION_RULES
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbPermission {
    pub id: String,
    pub identifier: String,
    pub description: Option<String>,
}

impl TryFrom<DbPermission> for Permission {
    type Error = AppError;

    fn try_from(value: DbPermission) -> Result<Self, Self::Error> {
        Ok(Permission {
            id: parse_row_uuid(&value.id)?,
            identifier: value.identifier,
            description: value.description,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionCreateRequest {
    #[schema(example = "CAN_MODERATE_COMMENTS")]
    pub identifier: String,
    pub description: Option<String>,
}

impl PermissionCreateRequest {
    pub fn validate(&self) -> AppResult<()> {
        if IDENTIFIER_REGEX.is_match(&self.identifier) {
            Ok(())
        } else {
            Err(AppError::validation(
                "identifier",
                "identifier must be 3 to 64 uppercase letters or underscores",
            ))
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PermissionUpdateRequest {
    pub description: Option<String>,
}
