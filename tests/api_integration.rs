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
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

use florada::create_app;
use florada::permissions::{PermissionIdentifier, PermissionRegistry};
use florada::storage::attachment_filename;
use florada::utils::{hash_password, utc_now};

const BOUNDARY: &str = "X-FLORADA-TEST-BOUNDARY";

#[tokio::test]
async fn full_api_flow() -> Result<()> {
    // temp dir holds both the sqlite db and the attachment files
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test.db");
    let attachments_dir = dir.path().join("attachments");

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
    std::env::set_var("ATTACHMENTS_DIR", attachments_dir.as_os_str());
    let app = create_app(pool.clone()).await?;

    // -- seed an author holding every permission and sign in
    seed_user(
        &pool,
        "author@example.com",
        "S3cure!Pass1",
        &PermissionIdentifier::ALL,
    )
    .await?;
    let token = login(&app, "author@example.com", "S3cure!Pass1").await?;

    // -- create a category
    let category_body = json!({
        "name": "Gestação",
        "description": "Artigos sobre gestação",
        "color": "#e03997"
    });
    let req = Request::builder()
        .method("POST")
        .uri("/category")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::from(category_body.to_string()))?;
    let (status, category_res) = send(&app, req).await?;
    assert_eq!(status, StatusCode::CREATED);
    let category_id = category_res
        .get("id")
        .and_then(|v| v.as_str())
        .context("missing category id")?
        .to_string();

    // -- publish a post with two embedded images
    let first_image = BASE64.encode(b"first image bytes");
    let second_image = BASE64.encode(b"second image bytes");
    let content = format!(
        r#"<p>Bem-vinda!</p><img src="data:image/png;base64,{first_image}"><img src="data:image/gif;base64,{second_image}">"#
    );
    let req = multipart_request(
        "POST",
        "/post",
        &token,
        &[
            ("title", "Primeiro post".to_string()),
            ("content", content),
            ("category_id", category_id.clone()),
        ],
    )?;
    let (status, post_res) = send(&app, req).await?;
    assert_eq!(status, StatusCode::CREATED, "publish failed: {post_res}");

    let post_id = post_res
        .get("id")
        .and_then(|v| v.as_str())
        .context("missing post id")?
        .to_string();
    assert_eq!(post_res["attachment_instance_count"], json!(2));

    let attachments = post_res["attachments"].as_array().context("attachments")?;
    let mut instance_ids: Vec<i64> = attachments
        .iter()
        .filter_map(|a| a["instance_id"].as_i64())
        .collect();
    instance_ids.sort();
    assert_eq!(instance_ids, vec![0, 1]);

    // rendered content points every image at a static URL
    let rendered = post_res["content"].as_str().context("content")?;
    assert_eq!(rendered.matches("/static/attachments/").count(), 2);
    assert!(!rendered.contains("data:"));

    // files exist on disk under {file_id}.{ext}
    for attachment in attachments {
        let file_id = Uuid::parse_str(attachment["file_id"].as_str().context("file_id")?)?;
        let mime = attachment["mime_type"].as_str().context("mime_type")?;
        let path = attachments_dir.join(attachment_filename(file_id, mime));
        assert!(path.exists(), "missing attachment file {}", path.display());
    }

    let dropped = attachments
        .iter()
        .find(|a| a["instance_id"] == json!(1))
        .context("attachment with instance 1")?;
    let dropped_path = attachments_dir.join(attachment_filename(
        Uuid::parse_str(dropped["file_id"].as_str().context("file_id")?)?,
        dropped["mime_type"].as_str().context("mime_type")?,
    ));

    // -- edit: keep image 0, drop image 1, add one new image
    let third_image = BASE64.encode(b"third image bytes");
    let updated_content = format!(
        r#"<p>Atualizado.</p><img attachment-instanceid="0"><img src="data:image/webp;base64,{third_image}">"#
    );
    let req = multipart_request(
        "PATCH",
        &format!("/post/{post_id}"),
        &token,
        &[
            ("title", "Primeiro post (editado)".to_string()),
            ("content", updated_content),
        ],
    )?;
    let (status, updated_res) = send(&app, req).await?;
    assert_eq!(status, StatusCode::OK, "update failed: {updated_res}");

    // counter keeps growing; freed id 1 is not reused
    assert_eq!(updated_res["attachment_instance_count"], json!(3));
    let mut updated_ids: Vec<i64> = updated_res["attachments"]
        .as_array()
        .context("attachments")?
        .iter()
        .filter_map(|a| a["instance_id"].as_i64())
        .collect();
    updated_ids.sort();
    assert_eq!(updated_ids, vec![0, 2]);

    // the dropped attachment's file was deleted after the commit
    assert!(!dropped_path.exists(), "orphaned file was not cleaned up");

    // -- the author sees their own restricted fields
    let req = Request::builder()
        .method("GET")
        .uri("/auth")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())?;
    let (status, me) = send(&app, req).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(me.get("created_at").is_some());
    assert!(me.get("permissions").is_some());

    // -- delete the post; remaining files disappear with it
    let remaining_paths: Vec<std::path::PathBuf> = updated_res["attachments"]
        .as_array()
        .context("attachments")?
        .iter()
        .map(|a| {
            Ok(attachments_dir.join(attachment_filename(
                Uuid::parse_str(a["file_id"].as_str().context("file_id")?)?,
                a["mime_type"].as_str().context("mime_type")?,
            )))
        })
        .collect::<Result<_>>()?;

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/post/{post_id}"))
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    for path in remaining_paths {
        assert!(!path.exists(), "file survived post deletion: {}", path.display());
    }

    let req = Request::builder()
        .method("GET")
        .uri(format!("/post/{post_id}"))
        .body(Body::empty())?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
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
    .bind("Author")
    .bind(password_hash)
    .bind(utc_now())
    .execute(pool)
    .await?;

    let registry = PermissionRegistry::new();
    for identifier in grants {
        let permission = registry.resolve(pool, *identifier).await?;
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
    if status != StatusCode::OK {
        anyhow::bail!("login failed: {status} - {res}");
    }

    Ok(res
        .get("token")
        .and_then(|v| v.as_str())
        .context("missing token")?
        .to_string())
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
