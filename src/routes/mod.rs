pub mod auth;
pub mod categories;
pub mod health;
pub mod permissions;
pub mod posts;
pub mod users;
