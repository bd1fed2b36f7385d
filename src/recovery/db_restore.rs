// vaultline/src/recovery/db_restore.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use url::Url;
use which::which;

use crate::archive::dump::{database_name_from_url, redact_url};

/// Loads a plain-SQL dump into a database, creating the database if needed.
#[async_trait]
pub trait DatabaseLoader: Send + Sync {
    async fn load(&self, database_url: &str, sql_file: &Path) -> Result<()>;
}

/// Creates the database through the `postgres` maintenance database, then runs
/// the dump through `psql` with `ON_ERROR_STOP`.
pub struct PsqlLoader;

#[async_trait]
impl DatabaseLoader for PsqlLoader {
    async fn load(&self, database_url: &str, sql_file: &Path) -> Result<()> {
        ensure_database_exists(database_url).await?;
        execute_sql_file_with_psql(database_url, sql_file).await
    }
}

/// Finds the psql executable in the system PATH.
fn find_psql_executable() -> Result<PathBuf> {
    which("psql").context(
        "psql executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
    )
}

/// Executes a SQL file against the specified database using the `psql` command-line tool.
async fn execute_sql_file_with_psql(target_db_url: &str, sql_file_path: &Path) -> Result<()> {
    if !sql_file_path.is_file() {
        return Err(anyhow::anyhow!(
            "SQL file for restoration not found: {}",
            sql_file_path.display()
        ));
    }

    let psql_path = find_psql_executable()?;
    println!(
        "Executing SQL file with psql: {} on database {}...",
        sql_file_path.display(),
        redact_url(target_db_url)
    );

    let output = Command::new(psql_path)
        .arg("-X") // Do not read psqlrc
        .arg("-q")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-d")
        .arg(target_db_url)
        .arg("-f")
        .arg(sql_file_path)
        .output()
        .await
        .with_context(|| format!("Failed to execute psql for {}", sql_file_path.display()))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "psql execution failed for file: {}.\nStatus: {}\nStdout: {}\nStderr: {}",
            sql_file_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("✓ Successfully executed SQL file: {}", sql_file_path.display());
    Ok(())
}

/// Connects to the server's `postgres` database and creates the target database
/// when it does not exist yet. Returns whether it was created.
pub async fn ensure_database_exists(target_db_url: &str) -> Result<bool> {
    let db_name = database_name_from_url(target_db_url)
        .context("DATABASE_URL must name the database to restore into")?;

    let mut admin_url =
        Url::parse(target_db_url).context("Invalid DATABASE_URL format for admin connection")?;
    admin_url.set_path("/postgres");

    let admin_pool = Pool::<Postgres>::connect(admin_url.as_str())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to 'postgres' database on target server: {}",
                admin_url.host_str().unwrap_or("unknown_host")
            )
        })?;

    let db_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&admin_pool)
            .await
            .with_context(|| format!("Failed to check existence of database '{}'", db_name))?;

    if db_exists {
        println!("Database '{}' already exists on the target server.", db_name);
        admin_pool.close().await;
        return Ok(false);
    }

    println!("Creating database '{}'...", db_name);
    let owner = Url::parse(target_db_url)?.username().to_string();
    let mut create_sql = format!(r#"CREATE DATABASE "{}""#, db_name.replace('"', "\"\""));
    if !owner.is_empty() {
        create_sql.push_str(&format!(r#" OWNER "{}""#, owner.replace('"', "\"\"")));
    }
    sqlx::query(&create_sql)
        .execute(&admin_pool)
        .await
        .with_context(|| format!("Failed to create database '{}'", db_name))?;
    admin_pool.close().await;
    println!("✓ Database '{}' created.", db_name);
    Ok(true)
}
