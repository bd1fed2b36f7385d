// vaultline/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::RetryPolicy;
use crate::reaper::StuckTimeouts;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub uploads_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub app_version: Option<String>,
    pub stuck_running_minutes: Option<i64>,
    pub stuck_pending_minutes: Option<i64>,
    pub maintenance_interval_minutes: Option<u64>,
    pub job_max_attempts: Option<u32>,
    pub job_backoff_seconds: Option<u64>,
}

// Application's internal configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub uploads_dir: PathBuf,
    pub env_file: PathBuf,
    pub temp_root: PathBuf,
    pub app_version: String,
    pub stuck_timeouts: StuckTimeouts,
    pub maintenance_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl AppConfig {
    /// Reads `config_path` (optional) and lets process environment variables
    /// override it. Call `dotenv` first so a local `.env` is honoured.
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = if config_path.is_file() {
            let content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            parse_raw_config(&content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            RawJsonConfig::default()
        };
        Self::from_sources(raw, |key| std::env::var(key).ok())
    }

    pub fn from_sources<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let database_url = env_value("DATABASE_URL")
            .or(raw.database_url)
            .filter(|s| !s.trim().is_empty())
            .context("database_url must be set in config.json or DATABASE_URL in the environment")?;

        let uploads_dir = env_value("UPLOADS_DIR")
            .map(PathBuf::from)
            .or(raw.uploads_dir)
            .unwrap_or_else(|| PathBuf::from("./uploads"));
        let env_file = env_value("ENV_FILE")
            .map(PathBuf::from)
            .or(raw.env_file)
            .unwrap_or_else(|| PathBuf::from("./.env"));
        let temp_root = env_value("BACKUP_TEMP_DIR")
            .map(PathBuf::from)
            .or(raw.temp_root)
            .unwrap_or_else(std::env::temp_dir);

        let running = positive(raw.stuck_running_minutes, 120, "stuck_running_minutes")?;
        let pending = positive(raw.stuck_pending_minutes, 30, "stuck_pending_minutes")?;
        let interval = raw.maintenance_interval_minutes.unwrap_or(15);
        if interval == 0 {
            return Err(anyhow::anyhow!(
                "maintenance_interval_minutes must be greater than zero in config.json."
            ));
        }
        let interval_secs = interval.checked_mul(60).with_context(|| {
            format!(
                "maintenance_interval_minutes is too large in config.json (got {}).",
                interval
            )
        })?;

        Ok(AppConfig {
            database_url,
            uploads_dir,
            env_file,
            temp_root,
            app_version: raw
                .app_version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            stuck_timeouts: StuckTimeouts {
                running: minutes(running, "stuck_running_minutes")?,
                pending: minutes(pending, "stuck_pending_minutes")?,
            },
            maintenance_interval: Duration::from_secs(interval_secs),
            retry_policy: RetryPolicy {
                max_attempts: raw.job_max_attempts.unwrap_or(3).max(1),
                backoff: Duration::from_secs(raw.job_backoff_seconds.unwrap_or(30)),
            },
        })
    }
}

fn parse_raw_config(content: &str) -> Result<RawJsonConfig> {
    Ok(serde_json::from_str(content)?)
}

fn positive(value: Option<i64>, default: i64, field: &str) -> Result<i64> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v),
        Some(v) => Err(anyhow::anyhow!(
            "{} must be greater than zero in config.json (got {}).",
            field,
            v
        )),
    }
}

fn minutes(value: i64, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::try_minutes(value)
        .with_context(|| format!("{} is too large in config.json (got {}).", field, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply_when_only_database_url_is_set() -> anyhow::Result<()> {
        let config = AppConfig::from_sources(
            RawJsonConfig::default(),
            env_of(&[("DATABASE_URL", "postgres://localhost/app")]),
        )?;

        assert_eq!(config.database_url, "postgres://localhost/app");
        assert_eq!(config.uploads_dir, PathBuf::from("./uploads"));
        assert_eq!(config.env_file, PathBuf::from("./.env"));
        assert_eq!(config.stuck_timeouts.running, chrono::Duration::minutes(120));
        assert_eq!(config.stuck_timeouts.pending, chrono::Duration::minutes(30));
        assert_eq!(config.maintenance_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.retry_policy.max_attempts, 3);
        assert_eq!(config.app_version, env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    #[test]
    fn test_environment_overrides_json() -> anyhow::Result<()> {
        let raw = parse_raw_config(
            r#"{
                "database_url": "postgres://json/app",
                "uploads_dir": "/srv/app/uploads",
                "stuck_running_minutes": 60,
                "job_max_attempts": 5
            }"#,
        )?;
        let config = AppConfig::from_sources(
            raw,
            env_of(&[
                ("DATABASE_URL", "postgres://env/app"),
                ("BACKUP_TEMP_DIR", "/var/tmp/backups"),
            ]),
        )?;

        assert_eq!(config.database_url, "postgres://env/app");
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/app/uploads"));
        assert_eq!(config.temp_root, PathBuf::from("/var/tmp/backups"));
        assert_eq!(config.stuck_timeouts.running, chrono::Duration::minutes(60));
        assert_eq!(config.retry_policy.max_attempts, 5);
        Ok(())
    }

    #[test]
    fn test_missing_database_url_is_rejected() {
        let result = AppConfig::from_sources(RawJsonConfig::default(), env_of(&[("DATABASE_URL", " ")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_timeouts_are_rejected() -> anyhow::Result<()> {
        let raw = parse_raw_config(r#"{ "database_url": "postgres://x/y", "stuck_pending_minutes": 0 }"#)?;
        assert!(AppConfig::from_sources(raw, env_of(&[])).is_err());

        let raw = parse_raw_config(r#"{ "database_url": "postgres://x/y", "maintenance_interval_minutes": 0 }"#)?;
        assert!(AppConfig::from_sources(raw, env_of(&[])).is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_intervals_are_rejected_not_overflowed() -> anyhow::Result<()> {
        let raw = parse_raw_config(
            r#"{ "database_url": "postgres://x/y", "maintenance_interval_minutes": 18446744073709551615 }"#,
        )?;
        let err = AppConfig::from_sources(raw, env_of(&[])).expect_err("overflow must be an error");
        assert!(err.to_string().contains("maintenance_interval_minutes"));

        let raw = parse_raw_config(
            r#"{ "database_url": "postgres://x/y", "stuck_running_minutes": 9223372036854775807 }"#,
        )?;
        let err = AppConfig::from_sources(raw, env_of(&[])).expect_err("overflow must be an error");
        assert!(err.to_string().contains("stuck_running_minutes"));
        Ok(())
    }

    #[test]
    fn test_malformed_config_file_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json")?;
        assert!(AppConfig::load(&path).is_err());
        Ok(())
    }
}
