// vaultline/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::DateTime;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    BACKUP_PREFIX, BackupObject, ProviderKind, StorageProvider, is_backup_name, key_file_name,
    optional_field, required_field, sort_newest_first,
};
use crate::errors::{AppError, Result};

const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Connection parameters shared by AWS-style and B2-style destinations.
#[derive(Debug, Clone)]
pub struct ObjectStorageSettings {
    pub kind: ProviderKind,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
}

impl ObjectStorageSettings {
    pub fn from_credentials(kind: ProviderKind, credentials: &serde_json::Value) -> Result<Self> {
        if !kind.is_object_storage() {
            return Err(AppError::Config(format!(
                "Provider '{}' is not an object storage backend",
                kind
            )));
        }
        if !credentials.is_object() {
            return Err(AppError::Config(
                "Object storage credentials must be a JSON object".to_string(),
            ));
        }

        let bucket = required_field(credentials, "bucket")
            .or_else(|_| required_field(credentials, "bucket_name"))?;
        let endpoint = optional_field(credentials, "endpoint")
            .or_else(|| optional_field(credentials, "endpoint_url"));
        let region = match (kind, optional_field(credentials, "region")) {
            (_, Some(region)) => region,
            (ProviderKind::B2, None) if endpoint.is_none() => {
                return Err(AppError::Config(
                    "B2 destinations need either a region or an endpoint".to_string(),
                ));
            }
            _ => DEFAULT_AWS_REGION.to_string(),
        };

        Ok(ObjectStorageSettings {
            kind,
            access_key_id: required_field(credentials, "access_key_id")?,
            secret_access_key: required_field(credentials, "secret_access_key")?,
            bucket,
            region,
            endpoint,
        })
    }

    /// The endpoint actually dialed. B2 without an explicit endpoint uses its
    /// S3-compatible regional host.
    pub fn resolved_endpoint(&self) -> Option<String> {
        match (&self.endpoint, self.kind) {
            (Some(endpoint), _) => Some(endpoint.clone()),
            (None, ProviderKind::B2) => {
                Some(format!("https://s3.{}.backblazeb2.com", self.region))
            }
            (None, _) => None,
        }
    }

    pub fn path_style(&self) -> bool {
        uses_path_style(self.resolved_endpoint().as_deref())
    }
}

/// Custom endpoints get path-style addressing: virtual-host addressing needs DNS
/// owned by the backend, which third-party endpoints don't provide.
pub fn uses_path_style(endpoint: Option<&str>) -> bool {
    endpoint.is_some()
}

pub struct ObjectStorageProvider {
    settings: ObjectStorageSettings,
    client: s3::Client,
}

impl ObjectStorageProvider {
    /// Builds the SDK client. Nothing is sent over the network here.
    pub async fn connect(settings: ObjectStorageSettings) -> Self {
        let endpoint = settings.resolved_endpoint();
        let path_style = settings.path_style();

        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &settings.access_key_id,
                &settings.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(path_style)
            .build();

        debug!(
            bucket = %settings.bucket,
            endpoint = endpoint.as_deref().unwrap_or("aws"),
            path_style,
            "Configured object storage client"
        );

        ObjectStorageProvider {
            client: s3::Client::from_conf(s3_config),
            settings,
        }
    }
}

#[async_trait]
impl StorageProvider for ObjectStorageProvider {
    fn describe(&self) -> String {
        format!("{}:{}", self.settings.kind, self.settings.bucket)
    }

    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        info!(
            "Uploading {} to bucket {} with key {}",
            local_path.display(),
            self.settings.bucket,
            key
        );

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            AppError::Storage(format!(
                "Failed to create ByteStream from file {}: {}",
                local_path.display(),
                e
            ))
        })?;

        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .content_type("application/gzip")
            .body(body)
            .send()
            .await
            .map_err(AppError::s3)?;

        info!("Uploaded {} to {}", key, self.describe());
        Ok(())
    }

    async fn download(&self, key: &str, dest_path: &Path) -> Result<()> {
        if let Some(parent_dir) = dest_path.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(AppError::s3)?;

        let mut output_file = File::create(dest_path).await?;
        let mut total_bytes_downloaded = 0usize;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| AppError::Storage(format!("Failed reading object {}: {}", key, e)))?
        {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len();
        }
        output_file.flush().await?;

        info!(
            "Downloaded {} bytes from {}/{} to {}",
            total_bytes_downloaded,
            self.settings.bucket,
            key,
            dest_path.display()
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(AppError::s3)?;
        info!("Deleted {} from {}", key, self.describe());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.settings.bucket)
                .prefix(BACKUP_PREFIX);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(AppError::s3)?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if !is_backup_name(key_file_name(key)) {
                    continue;
                }
                objects.push(BackupObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        sort_newest_first(&mut objects);
        Ok(objects)
    }

    async fn test_connection(&self) -> Result<()> {
        match self
            .client
            .head_bucket()
            .bucket(&self.settings.bucket)
            .send()
            .await
        {
            Ok(_) => {
                info!("Bucket {} is accessible", self.settings.bucket);
                Ok(())
            }
            Err(head_err) => {
                // Some scoped keys may list but not HEAD the bucket.
                warn!(
                    "HeadBucket on {} failed: {}. Trying a one-key listing instead...",
                    self.settings.bucket,
                    aws_sdk_s3::error::DisplayErrorContext(&head_err)
                );
                self.client
                    .list_objects_v2()
                    .bucket(&self.settings.bucket)
                    .prefix(BACKUP_PREFIX)
                    .max_keys(1)
                    .send()
                    .await
                    .map_err(AppError::s3)?;
                Ok(())
            }
        }
    }
}
