use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::models;
use crate::routes::health::HealthResponse;

#[derive(OpenApi)]
#[openapi(
	paths(
		crate::routes::auth::login,
		crate::routes::auth::current_user,
		crate::routes::auth::signout,
		crate::routes::users::create_user,
		crate::routes::users::list_users,
		crate::routes::users::get_user,
		crate::routes::users::update_user,
		crate::routes::users::delete_user,
		crate::routes::users::get_user_permissions,
		crate::routes::users::update_user_permissions,
		crate::routes::permissions::list_permissions,
		crate::routes::permissions::get_permission,
		crate::routes::permissions::create_permission,
		crate::routes::permissions::update_permission,
		crate::routes::permissions::delete_permission,
		crate::routes::categories::list_categories,
		crate::routes::categories::get_category,
		crate::routes::categories::create_category,
		crate::routes::categories::update_category,
		crate::routes::categories::delete_category,
		crate::routes::posts::list_posts,
		crate::routes::posts::allowed_items_per_page,
		crate::routes::posts::get_post,
		crate::routes::posts::create_post,
		crate::routes::posts::update_post,
		crate::routes::posts::delete_post,
		crate::routes::health::health
	),
	components(
		schemas(
			models::user::User,
			models::user::LoginRequest,
			models::user::UserCreateRequest,
			models::user::UserUpdateRequest,
			models::user::UpdateUserPermissionsRequest,
			models::permission::Permission,
			models::permission::PermissionCreateRequest,
			models::permission::PermissionUpdateRequest,
			models::category::Category,
			models::category::CategoryCreateRequest,
			models::category::CategoryUpdateRequest,
			models::post::Post,
			models::post::PostAttachment,
			HealthResponse
		)
	),
	tags(
		(name = "Auth", description = "Authentication and the current session"),
		(name = "Users", description = "User accounts and permission grants"),
		(name = "Permissions", description = "Permission records"),
		(name = "Categories", description = "Post categories"),
		(name = "Posts", description = "Posts and their attachments"),
		(name = "Health", description = "Liveness")
	)
)]
pub struct ApiDoc;

pub fn build_openapi(port: u16) -> anyhow::Result<utoipa::openapi::OpenApi> {
	let mut doc = serde_json::to_value(ApiDoc::openapi())?;

	normalize_path_operations(&mut doc);
	ensure_security_components(&mut doc);
	ensure_global_security(&mut doc);
	ensure_openapi_version(&mut doc);
	add_request_examples(&mut doc);
	ensure_servers(&mut doc, port);

	Ok(serde_json::from_value(doc)?)
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> Router {
	let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
		.try_it_out_enabled(true)
		.with_credentials(true)
		.persist_authorization(true);

	let doc_json = Arc::new(serde_json::to_value(&doc).expect("OpenAPI serialization must succeed"));

	let json_route = {
		let doc_json = Arc::clone(&doc_json);
		get(move || {
			let doc_json = Arc::clone(&doc_json);
			async move { Json((*doc_json).clone()) }
		})
	};

	Router::new()
		.route("/api-docs/openapi.json", json_route)
		.merge(SwaggerUi::new("/docs").config(swagger_config))
}

/// Lowercase and de-duplicate method keys so the document never carries a
/// duplicated mapping key into the Swagger parser.
fn normalize_path_operations(doc: &mut Value) {
	if let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) {
		let snapshot = paths.clone();
		for (path, item) in snapshot {
			if let Some(ops) = item.as_object() {
				let mut normalized = Map::new();
				for (method, val) in ops {
					let key = method.to_lowercase();
					if let Some(existing) = normalized.get_mut(&key) {
						merge_values(existing, val);
					} else {
						normalized.insert(key, val.clone());
					}
				}
				paths.insert(path, Value::Object(normalized));
			}
		}
	}
}

fn ensure_security_components(doc: &mut Value) {
	let components = doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("components")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
		.expect("components must be an object");

	let schemes = components
		.entry("securitySchemes")
		.or_insert_with(|| Value::Object(Map::new()))
		.as_object_mut()
		.expect("securitySchemes must be an object");

	schemes.insert(
		"bearerAuth".to_string(),
		json!({
			"type": "http",
			"scheme": "bearer",
			"bearerFormat": "JWT"
		}),
	);
}

fn ensure_global_security(doc: &mut Value) {
	doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("security")
		.or_insert_with(|| json!([{ "bearerAuth": [] }]));
}

fn ensure_openapi_version(doc: &mut Value) {
	doc
		.as_object_mut()
		.expect("OpenAPI root must be an object")
		.entry("openapi")
		.or_insert_with(|| Value::String("3.1.0".to_string()));
}

fn add_request_examples(doc: &mut Value) {
	let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) else {
		return;
	};

	for item in paths.values_mut() {
		let Some(operations) = item.as_object_mut() else { continue };
		for operation in operations.values_mut() {
			let Some(request_body) = operation.get_mut("requestBody") else { continue };
			let Some(content) = request_body.get_mut("content").and_then(Value::as_object_mut) else {
				continue;
			};
			let Some(app_json) = content.get_mut("application/json").and_then(Value::as_object_mut)
			else {
				continue;
			};
			let Some(reference) = app_json
				.get("schema")
				.and_then(Value::as_object)
				.and_then(|schema| schema.get("$ref"))
				.and_then(Value::as_str)
			else {
				continue;
			};

			let example = match reference {
				"#/components/schemas/LoginRequest" => Some(json!({
					"email": "ada@example.com",
					"password": "S3cureP@ssw0rd"
				})),
				"#/components/schemas/UserCreateRequest" => Some(json!({
					"email": "ada@example.com",
					"first_name": "Ada",
					"last_name": "Lovelace",
					"password": "S3cureP@ssw0rd"
				})),
				"#/components/schemas/CategoryCreateRequest" => Some(json!({
					"name": "Announcements",
					"description": "Site-wide announcements",
					"color": "#e03997"
				})),
				"#/components/schemas/PermissionCreateRequest" => Some(json!({
					"identifier": "CAN_MODERATE_COMMENTS",
					"description": "Moderate reader comments"
				})),
				_ => None,
			};

			if let Some(example) = example {
				app_json.insert("example".to_string(), example);
			}
		}
	}
}

fn ensure_servers(doc: &mut Value, port: u16) {
	let server_url = format!("http://localhost:{}", port);

	match doc.get_mut("servers") {
		Some(Value::Array(arr)) => {
			let has = arr
				.iter()
				.any(|v| v.get("url").and_then(Value::as_str) == Some(server_url.as_str()));
			if !has {
				arr.push(json!({ "url": server_url }));
			}
		}
		_ => {
			doc["servers"] = json!([{ "url": server_url }]);
		}
	}
}

fn merge_values(target: &mut Value, addition: &Value) {
	match (target, addition) {
		(Value::Object(dest), Value::Object(src)) => {
			for (key, value) in src {
				if let Some(existing) = dest.get_mut(key) {
					merge_values(existing, value);
				} else {
					dest.insert(key.clone(), value.clone());
				}
			}
		}
		(Value::Array(dest), Value::Array(src)) => {
			for item in src {
				if !dest.contains(item) {
					dest.push(item.clone());
				}
			}
		}
		_ => {}
	}
}
