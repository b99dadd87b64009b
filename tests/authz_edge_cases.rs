use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::tempdir;
use tower::util::ServiceExt;
use uuid::Uuid;

use florada::create_app;
use florada::permissions::{PermissionIdentifier, PermissionRegistry};
use florada::utils::{hash_password, utc_now};

#[tokio::test]
async fn authorization_edge_cases() -> Result<()> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test_authz.db");

    use sqlx::sqlite::SqliteConnectOptions;
    let opts = SqliteConnectOptions::new()
        .filename(db_path.as_path())
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator = sqlx::migrate::Migrator::new(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    )
    .await?;
    migrator.run(&pool).await?;

    std::env::set_var("JWT_SECRET", "test-secret");
    std::env::set_var("ATTACHMENTS_DIR", dir.path().join("attachments").as_os_str());
    let app = create_app(pool.clone()).await?;

    // author can publish and manage their own posts; reader holds only the
    // own-posts permission, which is not enough for someone else's post
    let author_id = seed_user(
        &pool,
        "author@example.com",
        "S3cure!Pass1",
        &[
            PermissionIdentifier::CanPublishPost,
            PermissionIdentifier::CanManageOwnPosts,
            PermissionIdentifier::CanManageCategories,
        ],
    )
    .await?;
    let reader_id = seed_user(
        &pool,
        "reader@example.com",
        "S3cure!Pass2",
        &[PermissionIdentifier::CanManageOwnPosts],
    )
    .await?;

    let author_token = login(&app, "author@example.com", "S3cure!Pass1").await?;
    let reader_token = login(&app, "reader@example.com", "S3cure!Pass2").await?;

    // 1. No token at all
    let req = Request::builder()
        .method("GET")
        .uri("/auth")
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 2. Garbage token
    let req = Request::builder()
        .method("GET")
        .uri("/auth")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 3. Publishing requires CAN_PUBLISH_POST
    let req = multipart_request(
        "POST",
        "/post",
        &reader_token,
        &[
            ("title", "Not allowed".to_string()),
            ("content", "<p>nope</p>".to_string()),
            ("category_id", Uuid::new_v4().to_string()),
        ],
    )?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // 4. Author publishes a post
    let category_id = create_category(&app, &author_token, "Notícias").await?;
    let req = multipart_request(
        "POST",
        "/post",
        &author_token,
        &[
            ("title", "Post do autor".to_string()),
            ("content", "<p>conteúdo</p>".to_string()),
            ("category_id", category_id),
        ],
    )?;
    let (status, post_res) = send(&app, req).await?;
    assert_eq!(status, StatusCode::CREATED);
    let post_id = post_res["id"].as_str().context("post id")?.to_string();

    // 5. Not the author and no CAN_MANAGE_ANY_POSTS: delete is forbidden and
    // the row stays put
    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/post/{post_id}"))
        .header("authorization", format!("Bearer {}", reader_token))
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM posts WHERE id = ?")
        .bind(&post_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 1, "post must be untouched after a forbidden delete");

    // 6. A granted CAN_MANAGE_ANY_POSTS turns the same request into a 204
    grant(&pool, reader_id, PermissionIdentifier::CanManageAnyPosts).await?;
    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/post/{post_id}"))
        .header("authorization", format!("Bearer {}", reader_token))
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // 7. A caller sees their own user with restricted fields included
    let req = Request::builder()
        .method("GET")
        .uri(format!("/user/{reader_id}"))
        .header("authorization", format!("Bearer {}", reader_token))
        .body(Body::empty())?;
    let (status, own_user) = send(&app, req).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(own_user.get("created_at").is_some());
    assert!(own_user.get("permissions").is_some());

    // 8. ...but not someone else's user without the manage-users permissions
    let req = Request::builder()
        .method("GET")
        .uri(format!("/user/{author_id}"))
        .header("authorization", format!("Bearer {}", reader_token))
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    Ok(())
}

async fn create_category(app: &Router, token: &str, name: &str) -> Result<String> {
    let req = Request::builder()
        .method("POST")
        .uri("/category")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(
            json!({ "name": name, "color": "#3498db" }).to_string(),
        ))?;
    let (status, res) = send(app, req).await?;
    anyhow::ensure!(status == StatusCode::CREATED, "category create failed: {res}");
    Ok(res["id"].as_str().context("category id")?.to_string())
}

async fn seed_user(
    pool: &SqlitePool,
    email: &str,
    password: &str,
    grants: &[PermissionIdentifier],
) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    let password_hash = hash_password(password)?;

    sqlx::query(
        "INSERT INTO users (id, email, first_name, last_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(email)
    .bind("Test")
    .bind("User")
    .bind(password_hash)
    .bind(utc_now())
    .execute(pool)
    .await?;

    for identifier in grants {
        grant(pool, user_id, *identifier).await?;
    }

    Ok(user_id)
}

async fn grant(pool: &SqlitePool, user_id: Uuid, identifier: PermissionIdentifier) -> Result<()> {
    let registry = PermissionRegistry::new();
    let permission = registry.resolve(pool, identifier).await?;

    sqlx::query(
        "INSERT OR IGNORE INTO user_permissions (user_id, permission_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(permission.id.to_string())
    .bind(utc_now())
    .execute(pool)
    .await?;

    Ok(())
}

async fn login(app: &Router, email: &str, password: &str) -> Result<String> {
    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "email": email, "password": password }).to_string()))?;

    let (status, res) = send(app, req).await?;
    anyhow::ensure!(status == StatusCode::OK, "login failed: {status} - {res}");

    Ok(res["token"].as_str().context("missing token")?.to_string())
}

async fn send(app: &Router, req: Request<Body>) -> Result<(StatusCode, Value)> {
    let resp: Response = app.clone().oneshot(req).await?;
    let status = resp.status();
    let body_bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    let value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes)?
    };
    Ok((status, value))
}

fn multipart_request(
    method: &str,
    uri: &str,
    token: &str,
    fields: &[(&str, String)],
) -> Result<Request<Body>> {
    let boundary = "X-FLORADA-TEST-BOUNDARY";
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body))?)
}
