use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::errors::Result;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: u32 = 1;
pub const UNKNOWN: &str = "unknown";

/// Provenance of an archive. Every field defaults so manifests from older
/// archives still parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub format_version: u32,
    #[serde(default = "unknown")]
    pub app_version: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default = "unknown")]
    pub database: String,
    #[serde(default = "unknown")]
    pub runtime_version: String,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl Manifest {
    pub fn new(app_version: &str, database: &str) -> Self {
        Manifest {
            format_version: FORMAT_VERSION,
            app_version: app_version.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            database: database.to_string(),
            runtime_version: runtime_version(),
        }
    }

    /// Stand-in for archives that predate manifests or carry a broken one.
    pub fn unknown() -> Self {
        Manifest {
            format_version: 0,
            app_version: unknown(),
            created_at: String::new(),
            database: unknown(),
            runtime_version: unknown(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.app_version == UNKNOWN
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }

    /// Never fails: a missing or unreadable manifest yields [`Manifest::unknown`].
    pub fn read_from(dir: &Path) -> Manifest {
        let path = dir.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return Manifest::unknown(),
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unparseable {}: {}", path.display(), e);
                Manifest::unknown()
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn runtime_version() -> String {
    format!(
        "{}/{} ({}-{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
