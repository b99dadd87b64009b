use std::collections::HashSet;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::{AppError, AppResult};
use crate::models::user::{DbUser, User};
use crate::permissions::{self, PermissionIdentifier};

/// Cookie carrying the identity token, httpOnly on the way out.
pub const AUTH_COOKIE: &str = "florada_authtoken";

const DEFAULT_EXP_DAYS: i64 = 15;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Arc<Vec<u8>>,
    pub exp_days: i64,
}

impl JwtConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let secret = std::env::var("JWT_SECRET").map_err(|_| AppError::configuration("JWT_SECRET not set"))?;
        let exp_days = std::env::var("JWT_EXP_DAYS")
            .map(|val| val.parse::<i64>())
            .unwrap_or(Ok(DEFAULT_EXP_DAYS))
            .map_err(|_| AppError::configuration("JWT_EXP_DAYS must be a valid integer"))?;

        Ok(Self {
            secret: Arc::new(secret.into_bytes()),
            exp_days,
        })
    }

    pub fn encode(&self, user_id: Uuid) -> Result<String, AppError> {
        use chrono::{Duration, Utc};

        let now = Utc::now();
        let exp = now + Duration::days(self.exp_days);

        let claims = Claims {
            sub: user_id,
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|err| AppError::token(err.to_string()))
    }

    pub fn decode(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|err| AppError::token(err.to_string()))
    }

    pub fn cookie_max_age_seconds(&self) -> i64 {
        self.exp_days * 24 * 60 * 60
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
    pub iat: usize,
}

/// The resolved caller: user row plus its granted permission identifiers,
/// loaded once per request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub permissions: HashSet<String>,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn has(&self, identifier: PermissionIdentifier) -> bool {
        self.permissions.contains(identifier.as_str())
    }

    /// Authorization gate: the exact declared permission, no hierarchy and
    /// no ownership fallback. Resolving through the registry keeps the
    /// permission row materialized and cached.
    pub async fn require(&self, state: &AppState, identifier: PermissionIdentifier) -> AppResult<()> {
        state.registry.resolve(&state.pool, identifier).await?;

        if self.has(identifier) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!("missing permission {identifier}")))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .ok_or_else(|| AppError::unauthorized("missing authentication token"))?;

        let claims = state.jwt.decode(&token)?;

        let db_user = sqlx::query_as::<_, DbUser>(
            "SELECT id, email, first_name, last_name, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(claims.sub.to_string())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::unauthorized("unknown user"))?;

        let identifiers = permissions::identifiers_for_user(&state.pool, claims.sub).await?;

        let mut user: User = db_user.try_into()?;
        user.permissions = Some(identifiers.clone());

        Ok(AuthUser {
            user,
            permissions: identifiers.into_iter().collect(),
        })
    }
}

/// Cookie first, then the Authorization header, matching the order clients
/// actually use them.
fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(cookies) = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|value| value.to_str().ok())
    {
        for pair in cookies.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(AUTH_COOKIE) {
                if let Some(token) = parts.next() {
                    if !token.is_empty() {
                        return Some(token.to_string());
                    }
                }
            }
        }
    }

    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}
