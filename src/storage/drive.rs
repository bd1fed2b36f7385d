// vaultline/src/storage/drive.rs
//! Google Drive backend. Drive has no keys, only files with names under a parent
//! folder, so every keyed operation first resolves the file by exact name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{
    BackupObject, StorageProvider, backup_key, is_backup_name, key_file_name, required_field,
    sort_newest_first,
};
use crate::errors::{AppError, Result};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,size,createdTime";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The parts of a service-account key document we need.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub service_account: ServiceAccountKey,
    pub folder_id: String,
}

impl DriveSettings {
    /// Accepts the key document either as a nested JSON object or as a pasted JSON string.
    pub fn from_credentials(credentials: &serde_json::Value) -> Result<Self> {
        let folder_id = required_field(credentials, "folder_id")?;
        let raw = credentials
            .get("service_account")
            .or_else(|| credentials.get("service_account_json"))
            .ok_or_else(|| {
                AppError::Config("Credential field 'service_account' is missing".to_string())
            })?;

        let document = match raw {
            serde_json::Value::String(text) => serde_json::from_str::<serde_json::Value>(text)
                .map_err(|e| {
                    AppError::Config(format!("Service account credential is not valid JSON: {e}"))
                })?,
            other => other.clone(),
        };

        let service_account: ServiceAccountKey =
            serde_json::from_value(document).map_err(|e| {
                AppError::Config(format!(
                    "Service account credential is missing required fields: {e}"
                ))
            })?;
        if !service_account.private_key.contains("PRIVATE KEY") {
            return Err(AppError::Config(
                "Service account private_key does not look like a PEM key".to_string(),
            ));
        }

        Ok(DriveSettings {
            service_account,
            folder_id,
        })
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct DriveProvider {
    settings: DriveSettings,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl DriveProvider {
    pub fn new(settings: DriveSettings) -> Result<Self> {
        // Fail on a bad key now rather than on the first request.
        EncodingKey::from_rsa_pem(settings.service_account.private_key.as_bytes())
            .map_err(|e| AppError::Config(format!("Service account private_key is invalid: {e}")))?;
        Ok(DriveProvider {
            settings,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let account = &self.settings.service_account;
        let token_uri = account.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &account.client_email,
            scope: DRIVE_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let response = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = check_status(response, "token exchange").await?.json().await?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64));
        debug!("Obtained Drive access token for {}", account.client_email);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn find_file(&self, name: &str) -> Result<Option<DriveFile>> {
        let token = self.access_token().await?;
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query_value(name),
            escape_query_value(&self.settings.folder_id)
        );
        let fields = format!("files({})", FILE_FIELDS);
        let response = self
            .http
            .get(format!("{}/files", DRIVE_API))
            .bearer_auth(&token)
            .query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "10"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await?;
        let list: FileList = check_status(response, "file lookup").await?.json().await?;
        Ok(list.files.into_iter().find(|f| f.name == name))
    }

    async fn require_file(&self, key: &str) -> Result<DriveFile> {
        let name = key_file_name(key);
        self.find_file(name).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "No file named '{}' in Drive folder {}",
                name, self.settings.folder_id
            ))
        })
    }
}

#[async_trait]
impl StorageProvider for DriveProvider {
    fn describe(&self) -> String {
        format!("google_drive:{}", self.settings.folder_id)
    }

    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        let name = key_file_name(key);
        let length = tokio::fs::metadata(local_path).await?.len();
        let token = self.access_token().await?;
        info!("Uploading {} to Drive as {}", local_path.display(), name);

        let metadata = serde_json::json!({
            "name": name,
            "parents": [self.settings.folder_id],
        });
        let session = self
            .http
            .post(format!("{}/files", DRIVE_UPLOAD_API))
            .bearer_auth(&token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Type", "application/gzip")
            .header("X-Upload-Content-Length", length.to_string())
            .json(&metadata)
            .send()
            .await?;
        let session = check_status(session, "upload session").await?;
        let location = session
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::Storage("Drive did not return an upload session URL".to_string())
            })?;

        let file = File::open(local_path).await?;
        let response = self
            .http
            .put(&location)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        check_status(response, "upload").await?;

        info!("Uploaded {} ({} bytes) to {}", name, length, self.describe());
        Ok(())
    }

    async fn download(&self, key: &str, dest_path: &Path) -> Result<()> {
        let file = self.require_file(key).await?;
        let token = self.access_token().await?;
        if let Some(parent_dir) = dest_path.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }

        let mut response = check_status(
            self.http
                .get(format!("{}/files/{}", DRIVE_API, file.id))
                .bearer_auth(&token)
                .query(&[("alt", "media"), ("supportsAllDrives", "true")])
                .send()
                .await?,
            "download",
        )
        .await?;

        let mut output_file = File::create(dest_path).await?;
        let mut total_bytes_downloaded = 0usize;
        while let Some(chunk) = response.chunk().await? {
            output_file.write_all(&chunk).await?;
            total_bytes_downloaded += chunk.len();
        }
        output_file.flush().await?;

        info!(
            "Downloaded {} bytes of {} to {}",
            total_bytes_downloaded,
            file.name,
            dest_path.display()
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let file = self.require_file(key).await?;
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(format!("{}/files/{}", DRIVE_API, file.id))
            .bearer_auth(&token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;
        check_status(response, "delete").await?;
        info!("Deleted {} from {}", file.name, self.describe());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupObject>> {
        let token = self.access_token().await?;
        let query = format!(
            "'{}' in parents and trashed = false",
            escape_query_value(&self.settings.folder_id)
        );
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.clone()),
                ("fields", fields.clone()),
                ("orderBy", "createdTime desc".to_string()),
                ("pageSize", "100".to_string()),
                ("supportsAllDrives", "true".to_string()),
                ("includeItemsFromAllDrives", "true".to_string()),
            ];
            if let Some(page) = &page_token {
                params.push(("pageToken", page.clone()));
            }
            let response = self
                .http
                .get(format!("{}/files", DRIVE_API))
                .bearer_auth(&token)
                .query(&params)
                .send()
                .await?;
            let page: FileList = check_status(response, "list").await?.json().await?;

            objects.extend(
                page.files
                    .into_iter()
                    .filter(|f| is_backup_name(&f.name))
                    .map(|f| BackupObject {
                        key: backup_key(&f.name),
                        size: f.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                        last_modified: f.created_time,
                    }),
            );

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        sort_newest_first(&mut objects);
        Ok(objects)
    }

    async fn test_connection(&self) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(format!("{}/files/{}", DRIVE_API, self.settings.folder_id))
            .bearer_auth(&token)
            .query(&[("fields", "id,name,mimeType"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let folder: DriveFile = check_status(response, "folder lookup").await?.json().await?;
        if folder.mime_type.as_deref() != Some(FOLDER_MIME_TYPE) {
            return Err(AppError::Config(format!(
                "Drive id {} ('{}') is not a folder",
                folder.id, folder.name
            )));
        }
        info!("Drive folder '{}' is accessible", folder.name);
        Ok(())
    }
}

/// Drive query literals are single-quoted; backslash and quote must be escaped.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(AppError::NotFound(format!("Drive {} returned 404: {}", action, body)));
    }
    Err(AppError::Storage(format!(
        "Drive {} failed with HTTP {}: {}",
        action, status, body
    )))
}
