//! Runtime settings read by key from the shared `app_settings` table.
//!
//! Injected as a capability so the orchestrator, scheduler and reapers can run
//! against an in-memory stand-in.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use crate::errors::Result;
use crate::scheduler::Cadence;

pub const SCHEDULE_KEY: &str = "backup_schedule";
pub const RETENTION_DAYS_KEY: &str = "backup_retention_days";
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Retention window in days. Missing, unparsable or negative values use the default.
pub async fn retention_days(settings: &dyn SettingsProvider) -> Result<i64> {
    let raw = settings.get(RETENTION_DAYS_KEY).await?;
    Ok(match raw.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_RETENTION_DAYS,
        Some(value) => match value.parse::<i64>() {
            Ok(days) if days >= 0 => days,
            _ => {
                warn!(
                    "Ignoring invalid {} value '{}', using {} days",
                    RETENTION_DAYS_KEY, value, DEFAULT_RETENTION_DAYS
                );
                DEFAULT_RETENTION_DAYS
            }
        },
    })
}

/// Configured cadence; anything unrecognised is treated as manual.
pub async fn schedule_cadence(settings: &dyn SettingsProvider) -> Result<Cadence> {
    let raw = settings.get(SCHEDULE_KEY).await?;
    Ok(match raw.as_deref() {
        None => Cadence::Manual,
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!("Unknown {} value '{}', treating as manual", SCHEDULE_KEY, value);
            Cadence::Manual
        }),
    })
}

#[derive(Clone)]
pub struct PgSettings {
    pool: PgPool,
}

impl PgSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsProvider for PgSettings {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
