use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use florada::db;
use florada::permissions::{PermissionIdentifier, PermissionRegistry};
use florada::utils::{hash_password, utc_now};

#[derive(Parser, Debug)]
#[command(author, version, about = "florada admin tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new empty migration with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Materialize the built-in permission identifiers
    SeedPermissions,
    /// Create a user account
    CreateUser {
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        password: String,
        /// Grant every built-in permission to the new account
        #[arg(long)]
        admin: bool,
    },
    /// Grant a permission to an existing user
    Grant {
        #[arg(long)]
        email: String,
        #[arg(long)]
        permission: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Try to load env from CWD; when running in Docker the binary CWD may
    // differ, so fall back to the crate-local `.env`.
    if dotenv().is_err() {
        let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let path = make_migration_file(&name)?;
            println!("Created migration: {}", path.display());
        }
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::SeedPermissions => {
            let pool = get_pool().await?;
            seed_permissions(&pool).await?;
            println!("Permissions seeded");
        }
        Commands::CreateUser {
            email,
            first_name,
            last_name,
            password,
            admin,
        } => {
            let pool = get_pool().await?;
            let user_id = create_user(&pool, &email, &first_name, &last_name, &password).await?;
            println!("Created user {email} ({user_id})");

            if admin {
                let registry = PermissionRegistry::new();
                for identifier in PermissionIdentifier::ALL {
                    let permission = registry.resolve(&pool, identifier).await?;
                    grant_permission(&pool, user_id, permission.id).await?;
                }
                println!("Granted all built-in permissions");
            }
        }
        Commands::Grant { email, permission } => {
            let pool = get_pool().await?;
            let user_id = find_user_id(&pool, &email)
                .await?
                .with_context(|| format!("no user with email {email}"))?;

            let identifier = PermissionIdentifier::parse(&permission)
                .with_context(|| format!("unknown permission identifier {permission}"))?;
            let registry = PermissionRegistry::new();
            let record = registry.resolve(&pool, identifier).await?;

            grant_permission(&pool, user_id, record.id).await?;
            println!("Granted {permission} to {email}");
        }
    }

    Ok(())
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    db::connect(&database_url).await
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    Ok(sqlx::migrate::Migrator::new(dir).await?)
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    let applied: Vec<i64> = sqlx::query("SELECT version FROM _sqlx_migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .map(|rows| rows.iter().map(|row| row.get::<i64, _>("version")).collect())
        .unwrap_or_default();

    for migration in migrator.iter() {
        let state = if applied.contains(&migration.version) {
            "applied"
        } else {
            "pending"
        };
        println!("{:>14} {:<40} {state}", migration.version, migration.description);
    }

    Ok(())
}

async fn seed_permissions(pool: &SqlitePool) -> anyhow::Result<()> {
    let registry = PermissionRegistry::new();
    for identifier in PermissionIdentifier::ALL {
        registry.resolve(pool, identifier).await?;
    }
    Ok(())
}

async fn create_user(
    pool: &SqlitePool,
    email: &str,
    first_name: &str,
    last_name: &str,
    password: &str,
) -> anyhow::Result<Uuid> {
    let user_id = Uuid::new_v4();
    let password_hash = hash_password(password).map_err(|err| anyhow::anyhow!(err.to_string()))?;

    sqlx::query(
        "INSERT INTO users (id, email, first_name, last_name, password_hash, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(email)
    .bind(first_name)
    .bind(last_name)
    .bind(password_hash)
    .bind(utc_now())
    .execute(pool)
    .await
    .context("failed to insert user (duplicate email?)")?;

    Ok(user_id)
}

async fn find_user_id(pool: &SqlitePool, email: &str) -> anyhow::Result<Option<Uuid>> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    Ok(id.and_then(|id| Uuid::parse_str(&id).ok()))
}

async fn grant_permission(pool: &SqlitePool, user_id: Uuid, permission_id: Uuid) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO user_permissions (user_id, permission_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(permission_id.to_string())
    .bind(utc_now())
    .execute(pool)
    .await?;

    Ok(())
}

fn make_migration_file(name: &str) -> anyhow::Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let sanitized = sanitize_name(name);
    let filename = format!("{}_{}.sql", timestamp, sanitized);
    let path = Path::new("migrations").join(filename);

    if path.exists() {
        anyhow::bail!("migration already exists: {}", path.display());
    }

    fs::create_dir_all("migrations")?;
    fs::write(&path, "-- Write your migration here\n")?;

    Ok(path)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
