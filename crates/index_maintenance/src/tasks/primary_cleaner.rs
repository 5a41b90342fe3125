use async_trait::async_trait;
use common::kv_store::DatabaseName;
use errors::ErrorMetadata;

use super::{
    BatchContext,
    BatchOutcome,
    MaintenanceTask,
    TaskKind,
};
use crate::progress::{
    next_partition,
    ProgressRecord,
};

/// Deletes the records of dropped tables, one hosted partition at a time.
pub(crate) struct PrimaryCleanerTask;

#[async_trait]
impl MaintenanceTask for PrimaryCleanerTask {
    fn kind(&self) -> TaskKind {
        TaskKind::PrimaryClean
    }

    async fn run_batch(
        &mut self,
        batch: &mut BatchContext<'_>,
        record: &mut ProgressRecord,
    ) -> anyhow::Result<BatchOutcome> {
        let Some(table_id) = record.next_table_to_clean() else {
            return Ok(BatchOutcome::Done);
        };
        let hosted = batch.env.hosted_partitions();
        let status = record.deleted_tables.get_mut(&table_id).ok_or_else(|| {
            ErrorMetadata::invariant_violation(
                "MissingTableProgress",
                format!("No deletion progress for table {table_id}"),
            )
        })?;

        let Some(partition) = next_partition(
            status.current_partition,
            &status.completed_partitions,
            &hosted,
        ) else {
            status.done = true;
            tracing::info!("Finished deleting the records of table {table_id}");
            return Ok(BatchOutcome::More { rows: 0 });
        };
        if status.current_partition != Some(partition) {
            status.current_partition = Some(partition);
            status.resume_key = None;
        }

        let db = DatabaseName::Partition(partition);
        let records = batch
            .scan_partition(&db, &status.parent_key_prefix, status.resume_key.as_deref())
            .await?;
        let mut deleted = 0;
        for (primary_key, _) in &records {
            if (status.major_key_complete || status.key_shape.matches(primary_key))
                && batch.tx.delete(&db, primary_key).await?
            {
                deleted += 1;
            }
        }
        if records.len() < batch.batch_size {
            status.completed_partitions.insert(partition);
            status.current_partition = None;
            status.resume_key = None;
        } else {
            status.resume_key = records.last().map(|(key, _)| key.clone());
        }
        Ok(BatchOutcome::More { rows: deleted })
    }
}
