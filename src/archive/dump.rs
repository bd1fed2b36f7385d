// vaultline/src/archive/dump.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;
use url::Url;
use which::which;

use crate::errors::{AppError, Result};

/// Produces a plain-SQL dump of the application database.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    fn database_name(&self) -> String;

    /// Writes the full dump (schema and data) to `dest`.
    async fn dump_to(&self, dest: &Path) -> Result<()>;
}

// Helper function to find pg_dump executable
fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").map_err(|_| {
        AppError::Config(
            "pg_dump executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.".to_string(),
        )
    })
}

/// `pg_dump` in plain format with ownership and privilege statements left out, so
/// the dump loads into a fresh database owned by whatever role restores it.
pub struct PgDump {
    database_url: String,
}

impl PgDump {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl DatabaseDumper for PgDump {
    fn database_name(&self) -> String {
        database_name_from_url(&self.database_url).unwrap_or_else(|_| "unknown".to_string())
    }

    async fn dump_to(&self, dest: &Path) -> Result<()> {
        let pg_dump_path = find_pg_dump_executable()?;
        info!(
            "Dumping {} to {} using pg_dump...",
            redact_url(&self.database_url),
            dest.display()
        );

        let output = Command::new(&pg_dump_path)
            .arg("--format=plain")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(dest)
            .arg(&self.database_url)
            .output()
            .await?;

        if !output.status.success() {
            // Never leave a half-written dump behind.
            let _ = tokio::fs::remove_file(dest).await;
            return Err(AppError::Command {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: format!(
                    "pg_dump exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        info!("Database {} dumped successfully via pg_dump.", self.database_name());
        Ok(())
    }
}

/// Extracts the database name from a PostgreSQL connection URL.
pub fn database_name_from_url(db_url: &str) -> Result<String> {
    let parsed_url = Url::parse(db_url)?;
    let path = parsed_url.path().trim_start_matches('/');
    if path.is_empty() {
        Err(AppError::InvalidInput(format!(
            "Database name not found in URL path: {}",
            redact_url(db_url)
        )))
    } else {
        Ok(path.to_string())
    }
}

/// Connection URL with the password masked, safe for logs.
pub fn redact_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
