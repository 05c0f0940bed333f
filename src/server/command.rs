use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};

use super::{IngestionContext, IngestionService};
use crate::config::IngestionMode;
use crate::error::IngestionError;
use crate::models::{IngestionCommandType, IngestionTaskCommand, IngestionTaskReport, PartitionKey};

impl IngestionService {
    /// Execute an ingestion command, always answering with a report.
    ///
    /// Failures are rendered as negative reports carrying `<causeKind>_<detail>`.
    #[tracing::instrument(level = "debug", skip(self, command), fields(command_type = command.command_type, topic = %command.topic_name, partition = command.partition_id))]
    pub async fn handle_command(&self, command: IngestionTaskCommand) -> IngestionTaskReport {
        self.stats.commands.fetch_add(1, Ordering::Relaxed);
        let mut report = IngestionTaskReport::positive(command.topic_name.clone(), command.partition_id);
        let res = match self.context() {
            Some(ctx) => execute_command(&ctx, &command, &mut report).await,
            None => Err(IngestionError::NotInitiated.into()),
        };
        if let Err(err) = &res {
            tracing::error!(error = ?err, command_type = command.command_type, topic = %command.topic_name, partition = command.partition_id, "error executing ingestion command");
        }
        self.finish_report(report, res)
    }
}

async fn execute_command(ctx: &IngestionContext, command: &IngestionTaskCommand, report: &mut IngestionTaskReport) -> Result<()> {
    let command_type = IngestionCommandType::from_i32(command.command_type).ok_or(IngestionError::UnsupportedCommand(command.command_type))?;
    let key = PartitionKey::parse(&command.topic_name, command.partition_id)?;
    let (model, consumption, storage) = (&ctx.model, &ctx.components.consumption, &ctx.components.storage);
    match command_type {
        IngestionCommandType::StartConsumption => {
            if ctx.config.ingestion_mode != IngestionMode::Isolated {
                bail!(IngestionError::IsolationDisabled);
            }
            model.subscribe(&key).await?;
            tracing::info!(%key, "started consumption");
        }
        IngestionCommandType::StopConsumption => {
            model.unsubscribe(&key).await?;
            tracing::info!(%key, "stopped consumption");
        }
        IngestionCommandType::KillConsumption => {
            let killed = model.kill(&key.resource).await?;
            report.message = format!("consumption task of {} killed: {}", key.resource, killed);
        }
        IngestionCommandType::ResetConsumption => {
            consumption
                .reset_consumption_offset(&key)
                .await
                .with_context(|| format!("error resetting offset of {}", key))?;
        }
        IngestionCommandType::IsPartitionConsuming => {
            report.is_positive = consumption.is_partition_consuming(&key);
        }
        IngestionCommandType::RemoveStorageEngine => {
            storage.remove_storage_engine(&key.resource).await?;
            tracing::info!(resource = %key.resource, remaining = ?storage.local_resources(), "removed storage engine");
        }
        IngestionCommandType::RemovePartition => {
            model.remove_partition(&key).await?;
            tracing::info!(%key, "removed partition");
        }
        IngestionCommandType::OpenStorageEngine => {
            storage.open_metadata_partition(&key.resource).await?;
        }
        IngestionCommandType::PromoteToLeader | IngestionCommandType::DemoteToStandby => {
            if model.fence().is_unsubscribing(&key) {
                tracing::warn!(%key, ?command_type, "partition is being unsubscribed, rejecting leadership change");
                bail!(IngestionError::Fenced { key: key.to_string() });
            }
            let section = model.fence().next_section(&key);
            if command_type == IngestionCommandType::PromoteToLeader {
                model.become_leader_from_standby(&key, section).await?;
            } else {
                model.become_standby_from_leader(&key, section).await?;
            }
        }
    }
    Ok(())
}
