use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::tempdir;
use tower::util::ServiceExt;
use uuid::Uuid;

use florada::create_app;
use florada::permissions::{PermissionIdentifier, PermissionRegistry};
use florada::utils::{hash_password, utc_now};

const BOUNDARY: &str = "X-FLORADA-TEST-BOUNDARY";

#[tokio::test]
async fn reconcile_is_idempotent_and_instance_ids_never_regress() -> Result<()> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test_reconcile.db");

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

    seed_author(&pool, "author@example.com", "S3cure!Pass1").await?;
    let token = login(&app, "author@example.com", "S3cure!Pass1").await?;
    let category_id = create_category(&app, &token).await?;

    // publish with two embedded images -> instance ids 0 and 1
    let content = format!(
        r#"<img src="data:image/png;base64,{}"><img src="data:image/png;base64,{}">"#,
        BASE64.encode(b"image zero"),
        BASE64.encode(b"image one"),
    );
    let (status, created) = send(
        &app,
        multipart_request(
            "POST",
            "/post",
            &token,
            &[
                ("title", "Reconcílio".to_string()),
                ("content", content),
                ("category_id", category_id),
            ],
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED, "publish failed: {created}");
    let post_id = created["id"].as_str().context("post id")?.to_string();
    assert_eq!(created["attachment_instance_count"], json!(2));
    let original_file_ids = file_ids(&created)?;

    // 1. Idempotence: referencing the full current set with no new images
    // changes neither the counter nor the row set
    let keep_all = r#"<img attachment-instanceid="0"><img attachment-instanceid="1">"#.to_string();
    let (status, unchanged) = send(
        &app,
        multipart_request(
            "PATCH",
            &format!("/post/{post_id}"),
            &token,
            &[("content", keep_all)],
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(unchanged["attachment_instance_count"], json!(2));
    assert_eq!(instance_ids(&unchanged)?, vec![0, 1]);
    assert_eq!(file_ids(&unchanged)?, original_file_ids);

    // 2. Drop id 1, add two new images -> they get ids 2 and 3, the counter
    // moves to 4
    let update = format!(
        r#"<img attachment-instanceid="0"><img src="data:image/png;base64,{}"><img src="data:image/png;base64,{}">"#,
        BASE64.encode(b"image two"),
        BASE64.encode(b"image three"),
    );
    let (status, second) = send(
        &app,
        multipart_request(
            "PATCH",
            &format!("/post/{post_id}"),
            &token,
            &[("content", update)],
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["attachment_instance_count"], json!(4));
    assert_eq!(instance_ids(&second)?, vec![0, 2, 3]);

    // 3. Replace everything with one fresh image -> id 4; the freed ids
    // 1, 2 and 3 are never handed out again
    let replace_all = format!(
        r#"<img src="data:image/png;base64,{}">"#,
        BASE64.encode(b"image four"),
    );
    let (status, third) = send(
        &app,
        multipart_request(
            "PATCH",
            &format!("/post/{post_id}"),
            &token,
            &[("content", replace_all)],
        )?,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(third["attachment_instance_count"], json!(5));
    assert_eq!(instance_ids(&third)?, vec![4]);

    // per-post uniqueness held throughout: no duplicate instance id ever
    // appeared in a row set
    let duplicates: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM (SELECT instance_id FROM post_attachments WHERE post_id = ? GROUP BY instance_id HAVING COUNT(1) > 1)",
    )
    .bind(&post_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(duplicates, 0);

    Ok(())
}

fn instance_ids(post: &Value) -> Result<Vec<i64>> {
    let mut ids: Vec<i64> = post["attachments"]
        .as_array()
        .context("attachments")?
        .iter()
        .filter_map(|a| a["instance_id"].as_i64())
        .collect();
    ids.sort();
    Ok(ids)
}

fn file_ids(post: &Value) -> Result<Vec<String>> {
    let mut ids: Vec<String> = post["attachments"]
        .as_array()
        .context("attachments")?
        .iter()
        .filter_map(|a| a["file_id"].as_str().map(str::to_string))
        .collect();
    ids.sort();
    Ok(ids)
}

async fn create_category(app: &Router, token: &str) -> Result<String> {
    let req = Request::builder()
        .method("POST")
        .uri("/category")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(
            json!({ "name": "Notas", "color": "#3498db" }).to_string(),
        ))?;
    let (status, res) = send(app, req).await?;
    anyhow::ensure!(status == StatusCode::CREATED, "category create failed: {res}");
    Ok(res["id"].as_str().context("category id")?.to_string())
}

async fn seed_author(pool: &SqlitePool, email: &str, password: &str) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    let password_hash = hash_password(password)?;

    sqlx::query(
        "INSERT INTO users (id, email, first_name, last_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(email)
    .bind("Test")
    .bind("Author")
    .bind(password_hash)
    .bind(utc_now())
    .execute(pool)
    .await?;

    let registry = PermissionRegistry::new();
    for identifier in [
        PermissionIdentifier::CanPublishPost,
        PermissionIdentifier::CanManageOwnPosts,
        PermissionIdentifier::CanManageCategories,
    ] {
        let permission = registry.resolve(pool, identifier).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO user_permissions (user_id, permission_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(permission.id.to_string())
        .bind(utc_now())
        .execute(pool)
        .await?;
    }

    Ok(user_id)
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
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\ncontent-disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(body))?)
}
