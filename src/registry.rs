//! Named backup destinations: what the admin UI creates, toggles and tests.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::{BackupDestination, NewDestination};
use crate::storage::{self, ProviderResolver};
use crate::store::BackupStore;

pub struct DestinationRegistry {
    store: Arc<dyn BackupStore>,
    providers: Arc<dyn ProviderResolver>,
}

impl DestinationRegistry {
    pub fn new(store: Arc<dyn BackupStore>, providers: Arc<dyn ProviderResolver>) -> Self {
        Self { store, providers }
    }

    /// Rejects blank names and credential payloads the provider could never use.
    pub async fn create(&self, new: NewDestination) -> Result<BackupDestination> {
        if new.name.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "destination name must not be empty".to_string(),
            ));
        }
        storage::validate_credentials(new.provider, &new.credentials)?;
        let destination = self.store.create_destination(new).await?;
        info!(
            "Registered {} destination '{}' ({})",
            destination.provider, destination.name, destination.id
        );
        Ok(destination)
    }

    pub async fn list(&self) -> Result<Vec<BackupDestination>> {
        self.store.list_destinations().await
    }

    pub async fn get(&self, id: Uuid) -> Result<BackupDestination> {
        self.store
            .get_destination(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup destination {id}")))
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        if !self.store.set_destination_active(id, active).await? {
            return Err(AppError::NotFound(format!("backup destination {id}")));
        }
        info!("Destination {} is now {}", id, if active { "active" } else { "inactive" });
        Ok(())
    }

    pub async fn update_credentials(&self, id: Uuid, credentials: serde_json::Value) -> Result<()> {
        let destination = self.get(id).await?;
        storage::validate_credentials(destination.provider, &credentials)?;
        if !self.store.update_destination_credentials(id, credentials).await? {
            return Err(AppError::NotFound(format!("backup destination {id}")));
        }
        Ok(())
    }

    pub async fn test_connection(&self, id: Uuid) -> Result<()> {
        let destination = self.get(id).await?;
        let provider = self.providers.resolve(&destination).await?;
        match provider.test_connection().await {
            Ok(()) => {
                info!("Connection to '{}' ({}) OK", destination.name, provider.describe());
                Ok(())
            }
            Err(e) => {
                warn!("Connection to '{}' failed: {}", destination.name, e);
                Err(e)
            }
        }
    }

    /// Checks credentials that have not been saved yet.
    pub async fn test_credentials(&self, kind: &str, credentials: &serde_json::Value) -> Result<()> {
        let provider = storage::provider_from_credentials(kind, credentials).await?;
        provider.test_connection().await
    }
}
