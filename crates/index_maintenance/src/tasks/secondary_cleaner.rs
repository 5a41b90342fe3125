use async_trait::async_trait;
use errors::ErrorMetadata;

use super::{
    BatchContext,
    BatchOutcome,
    MaintenanceTask,
    TaskKind,
};
use crate::{
    progress::ProgressRecord,
    registry::encode_entry,
};

/// Walks an index in entry order and removes the entries whose primary
/// records live in partitions this node no longer hosts.
pub(crate) struct SecondaryCleanerTask;

#[async_trait]
impl MaintenanceTask for SecondaryCleanerTask {
    fn kind(&self) -> TaskKind {
        TaskKind::SecondaryClean
    }

    async fn run_batch(
        &mut self,
        batch: &mut BatchContext<'_>,
        record: &mut ProgressRecord,
    ) -> anyhow::Result<BatchOutcome> {
        let Some(handle) = batch.claim_index(|handles| {
            record
                .next_index_to_clean(|name| handles.contains_key(name))
                .cloned()
        }) else {
            if record.next_index_to_clean(|_| true).is_some() {
                return Ok(BatchOutcome::Blocked);
            }
            return Ok(BatchOutcome::Done);
        };
        let hosted = batch.env.hosted_partitions();
        let status = record.secondaries.get_mut(&handle.db_name).ok_or_else(|| {
            ErrorMetadata::invariant_violation(
                "MissingIndexProgress",
                format!("No progress entry for {}", handle.db_name),
            )
        })?;

        let after = match (&status.resume_key, &status.resume_data) {
            (Some(secondary_key), Some(primary_key)) => {
                Some(encode_entry(secondary_key, primary_key)?)
            },
            _ => None,
        };
        let result = handle
            .clean_orphans(
                &mut *batch.tx,
                batch.env,
                &hosted,
                after.as_deref(),
                batch.batch_size,
            )
            .await?;
        if result.scanned < batch.batch_size {
            status.finish_cleaning();
            tracing::info!("Finished cleaning secondary index {}", handle.db_name);
        } else if let Some((secondary_key, primary_key)) = result.last {
            status.resume_key = Some(secondary_key);
            status.resume_data = Some(primary_key);
        }
        Ok(BatchOutcome::More {
            rows: result.deleted,
        })
    }
}
