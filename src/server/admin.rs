use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use super::{IngestionContext, IngestionService};
use crate::error::IngestionError;
use crate::models::{
    IngestionComponentType, IngestionMetadataUpdateType, IngestionStorageMetadata, IngestionTaskReport, PartitionKey, ProcessShutdownCommand,
};

impl IngestionService {
    /// Apply a storage metadata update.
    #[tracing::instrument(level = "debug", skip(self, metadata), fields(update_type = metadata.metadata_update_type, topic = %metadata.topic_name, partition = metadata.partition_id))]
    pub async fn handle_update_metadata(&self, metadata: IngestionStorageMetadata) -> IngestionTaskReport {
        self.stats.commands.fetch_add(1, Ordering::Relaxed);
        let report = IngestionTaskReport::positive(metadata.topic_name.clone(), metadata.partition_id);
        let res = match self.context() {
            Some(ctx) => update_metadata(&ctx, &metadata).await,
            None => Err(IngestionError::NotInitiated.into()),
        };
        if let Err(err) = &res {
            tracing::error!(error = ?err, topic = %metadata.topic_name, partition = metadata.partition_id, "error updating storage metadata");
        }
        self.finish_report(report, res)
    }

    /// Stop one of the worker's components.
    #[tracing::instrument(level = "debug", skip(self, command), fields(component_type = command.component_type))]
    pub async fn handle_shutdown_component(&self, command: ProcessShutdownCommand) -> IngestionTaskReport {
        self.stats.commands.fetch_add(1, Ordering::Relaxed);
        let report = IngestionTaskReport::positive("", 0);
        let res = match self.context() {
            Some(ctx) => shutdown_component(&ctx, command.component_type).await,
            None => Err(IngestionError::NotInitiated.into()),
        };
        if let Err(err) = &res {
            tracing::error!(error = ?err, component_type = command.component_type, "error shutting down component");
        }
        self.finish_report(report, res)
    }
}

async fn update_metadata(ctx: &IngestionContext, metadata: &IngestionStorageMetadata) -> Result<()> {
    let update_type = IngestionMetadataUpdateType::from_i32(metadata.metadata_update_type)
        .ok_or(IngestionError::UnsupportedMetadataUpdate(metadata.metadata_update_type))?;
    let key = PartitionKey::parse(&metadata.topic_name, metadata.partition_id)?;
    let service = &ctx.components.storage_metadata;
    match update_type {
        IngestionMetadataUpdateType::PutOffsetRecord => service
            .put_offset_record(&key, &metadata.payload)
            .await
            .with_context(|| format!("error putting offset record of {}", key))?,
        IngestionMetadataUpdateType::ClearOffsetRecord => service
            .clear_offset_record(&key)
            .await
            .with_context(|| format!("error clearing offset record of {}", key))?,
        IngestionMetadataUpdateType::PutStoreVersionState => service
            .put_store_version_state(&key.resource, &metadata.payload)
            .await
            .with_context(|| format!("error putting store version state of {}", key.resource))?,
        IngestionMetadataUpdateType::ClearStoreVersionState => service
            .clear_store_version_state(&key.resource)
            .await
            .with_context(|| format!("error clearing store version state of {}", key.resource))?,
    }
    tracing::debug!(%key, ?update_type, "applied storage metadata update");
    Ok(())
}

async fn shutdown_component(ctx: &IngestionContext, component_type: i32) -> Result<()> {
    match IngestionComponentType::from_i32(component_type) {
        Some(IngestionComponentType::ConsumptionService) => {
            ctx.components.consumption.stop().await.context("error stopping consumption service")?;
            tracing::info!("consumption service has been shutdown");
        }
        Some(IngestionComponentType::StorageService) => {
            ctx.components.storage.stop().await.context("error stopping storage service")?;
            tracing::info!("storage service has been shutdown");
        }
        None => return Err(IngestionError::UnsupportedComponent(component_type).into()),
    }
    Ok(())
}
