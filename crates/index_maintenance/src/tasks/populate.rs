use std::sync::Arc;

use async_trait::async_trait;
use common::kv_store::DatabaseName;
use errors::ErrorMetadata;

use super::{
    BatchContext,
    BatchOutcome,
    MaintenanceTask,
    TaskKind,
};
use crate::{
    progress::{
        next_partition,
        ProgressRecord,
    },
    registry::IndexHandle,
};

/// Builds the entries of indexes that need populating, one hosted partition
/// at a time, resuming after the last primary key of the previous batch.
#[derive(Default)]
pub(crate) struct PopulateTask {
    /// Indexes whose population the current batch completes.
    finished: Vec<Arc<IndexHandle>>,
}

#[async_trait]
impl MaintenanceTask for PopulateTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Populate
    }

    async fn run_batch(
        &mut self,
        batch: &mut BatchContext<'_>,
        record: &mut ProgressRecord,
    ) -> anyhow::Result<BatchOutcome> {
        self.finished.clear();
        let Some(handle) = batch.claim_index(|handles| {
            record
                .next_index_to_populate(|name| handles.contains_key(name))
                .cloned()
        }) else {
            if record.next_index_to_populate(|_| true).is_some() {
                // The reconciler triggers another check once it opens them.
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

        let Some(partition) = next_partition(
            status.current_partition,
            &status.completed_partitions,
            &hosted,
        ) else {
            status.finish_populating();
            tracing::info!("Finished populating secondary index {}", handle.db_name);
            self.finished.push(handle);
            return Ok(BatchOutcome::More { rows: 0 });
        };
        if status.current_partition != Some(partition) {
            tracing::debug!("Populating {} from partition {partition}", handle.db_name);
            status.current_partition = Some(partition);
            status.resume_key = None;
        }

        let records = batch
            .scan_partition(
                &DatabaseName::Partition(partition),
                &handle.scan_prefix,
                status.resume_key.as_deref(),
            )
            .await?;
        let mut rows = 0;
        for (primary_key, value) in &records {
            if handle.matches(primary_key) {
                rows += handle
                    .insert_entries(&mut *batch.tx, primary_key, Some(value))
                    .await?;
            }
        }
        if records.len() < batch.batch_size {
            status.completed_partitions.insert(partition);
            status.current_partition = None;
            status.resume_key = None;
        } else {
            status.resume_key = records.last().map(|(key, _)| key.clone());
        }
        Ok(BatchOutcome::More { rows })
    }

    fn after_commit(&mut self) {
        for handle in self.finished.drain(..) {
            handle.set_populating(false);
        }
    }
}
