use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{get, patch, post};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::jwt::JwtConfig;
use crate::permissions::PermissionRegistry;
use crate::routes::{auth, categories, health, permissions, posts, users};
use crate::storage::{AttachmentStore, MAX_ATTACHMENTS_PER_POST, MAX_ATTACHMENT_BYTES};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub registry: Arc<PermissionRegistry>,
    pub attachments: Arc<AttachmentStore>,
}

impl AppState {
    pub fn new(pool: SqlitePool, jwt: JwtConfig, attachments: AttachmentStore) -> Self {
        Self {
            pool,
            jwt: Arc::new(jwt),
            registry: Arc::new(PermissionRegistry::new()),
            attachments: Arc::new(attachments),
        }
    }
}

pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let attachments = AttachmentStore::from_env();
    attachments.ensure_dir().await?;

    let state = AppState::new(pool, jwt_config, attachments);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let auth_routes = Router::new()
        .route("/", get(auth::current_user))
        .route("/login", post(auth::login))
        .route("/signout", get(auth::signout));

    let user_routes = Router::new()
        .route("/", post(users::create_user).get(users::list_users))
        .route(
            "/:id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/permission/:id", get(users::get_user_permissions))
        .route("/:id/permissions", patch(users::update_user_permissions));

    let permission_routes = Router::new()
        .route(
            "/",
            get(permissions::list_permissions).post(permissions::create_permission),
        )
        .route(
            "/:id",
            get(permissions::get_permission)
                .patch(permissions::update_permission)
                .delete(permissions::delete_permission),
        );

    let category_routes = Router::new()
        .route(
            "/",
            get(categories::list_categories).post(categories::create_category),
        )
        .route(
            "/:id",
            get(categories::get_category)
                .patch(categories::update_category)
                .delete(categories::delete_category),
        );

    // Multipart bodies can legitimately carry a full set of embedded images.
    let post_body_limit = (MAX_ATTACHMENTS_PER_POST * MAX_ATTACHMENT_BYTES) * 2;
    let post_routes = Router::new()
        .route("/", get(posts::list_posts).post(posts::create_post))
        .route("/allowed-items-per-page", get(posts::allowed_items_per_page))
        .route(
            "/:id",
            get(posts::get_post)
                .patch(posts::update_post)
                .delete(posts::delete_post),
        )
        .layer(DefaultBodyLimit::max(post_body_limit));

    let static_dir = state.attachments.dir().to_path_buf();

    let router = Router::new()
        .nest("/auth", auth_routes)
        .nest("/user", user_routes)
        .nest("/permission", permission_routes)
        .nest("/category", category_routes)
        .nest("/post", post_routes)
        .route("/health", get(health::health))
        .nest_service("/static/attachments", ServeDir::new(static_dir))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}
