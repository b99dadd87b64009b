use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand_core::OsRng;
use regex::Regex;

use crate::errors::AppError;

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 32;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex must compile")
});

pub fn hash_password(password: &str) -> Result<String, AppError> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::bad_request(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AppError::internal(format!("failed to hash password: {err}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|err| AppError::internal(format!("invalid password hash: {err}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// 8-32 chars with at least one lowercase, one uppercase, one digit and one
/// symbol, no whitespace. Checked character-by-character because the regex
/// crate has no lookahead.
pub fn password_strength_error(password: &str) -> Option<&'static str> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&len) {
        return Some("password must be 8 to 32 characters long");
    }
    if password.chars().any(char::is_whitespace) {
        return Some("password must not contain whitespace");
    }

    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_ascii_alphanumeric());

    if has_lower && has_upper && has_digit && has_symbol {
        None
    } else {
        Some("password needs an uppercase letter, a lowercase letter, a digit and a symbol")
    }
}

/// Person-name rule shared by first and last name: 3-32 chars, letters plus
/// a few joining marks, no digits.
pub fn person_name_error(name: &str) -> Option<&'static str> {
    let len = name.chars().count();
    if !(3..=32).contains(&len) {
        return Some("name must be 3 to 32 characters long");
    }
    if name.chars().any(|c| c.is_ascii_digit()) {
        return Some("name must not contain digits");
    }
    let allowed = |c: char| c.is_alphabetic() || matches!(c, ' ' | '\'' | '-' | ',' | '.');
    if name.chars().all(allowed) {
        None
    } else {
        Some("name contains characters that are not allowed")
    }
}

pub fn is_valid_email(email: &str) -> bool {
    email.chars().count() <= 128 && EMAIL_REGEX.is_match(email)
}

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
