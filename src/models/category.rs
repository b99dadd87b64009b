use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, AppResult, FieldErrors};
use crate::models::user::parse_row_uuid;
use crate::serializer::{FieldRule, Shaped};

static COLOR_HEX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#(?:[0-9a-fA-F]{3,4}){1,2}$").expect("color regex must compile"));

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "#e03997")]
    pub color: String,
    pub created_at: DateTime<Utc>,
}

static CATEGORY_RULES: &[FieldRule] = &[
    FieldRule::always("id"),
    FieldRule::always("name"),
    FieldRule::always("description").exclude_if_null(),
    FieldRule::always("color"),
    FieldRule::always("created_at"),
];

impl Shaped for Category {
    fn visibility() -> &'static [FieldRule] {
        CATEGORY_RULES
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbCategory {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbCategory> for Category {
    type Error = AppError;

    fn try_from(value: DbCategory) -> Result<Self, Self::Error> {
        Ok(Category {
            id: parse_row_uuid(&value.id)?,
            name: value.name,
            description: value.description,
            color: value.color,
            created_at: value.created_at,
        })
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CategoryCreateRequest {
    #[schema(example = "Announcements")]
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "#e03997")]
    pub color: String,
}

impl CategoryCreateRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut fields = FieldErrors::new();
        validate_name(self.name.trim(), &mut fields);
        validate_description(self.description.as_deref(), &mut fields);
        validate_color(&self.color, &mut fields);

        if fields.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(fields))
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CategoryUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

impl CategoryUpdateRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut fields = FieldErrors::new();
        if let Some(name) = self.name.as_deref() {
            validate_name(name.trim(), &mut fields);
        }
        validate_description(self.description.as_deref(), &mut fields);
        if let Some(color) = self.color.as_deref() {
            validate_color(color, &mut fields);
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(fields))
        }
    }
}

fn validate_name(name: &str, fields: &mut FieldErrors) {
    let len = name.chars().count();
    if !(3..=32).contains(&len) {
        fields.insert(
            "name".to_string(),
            "name must be 3 to 32 characters long".to_string(),
        );
    }
}

fn validate_description(description: Option<&str>, fields: &mut FieldErrors) {
    if let Some(description) = description {
        if description.chars().count() > 255 {
            fields.insert(
                "description".to_string(),
                "description must be at most 255 characters".to_string(),
            );
        }
    }
}

fn validate_color(color: &str, fields: &mut FieldErrors) {
    if !COLOR_HEX_REGEX.is_match(color) {
        fields.insert(
            "color".to_string(),
            "color must be a hex value like #e03997".to_string(),
        );
    }
}
