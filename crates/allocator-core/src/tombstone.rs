//! Tombstoner (spec.md §4.5): two-phase archival of long-dead jobs into a
//! secondary historical store.

use std::sync::Arc;

use crate::error::{AllocatorError, Result};
use crate::store::{HistoricalStore, Store};
use crate::types::now;

pub struct Tombstoner {
    store: Arc<dyn Store>,
    historical: Option<Arc<dyn HistoricalStore>>,
    grace_period_secs: i64,
}

impl Tombstoner {
    pub fn new(
        store: Arc<dyn Store>,
        historical: Option<Arc<dyn HistoricalStore>>,
        grace_period_secs: i64,
    ) -> Self {
        Self {
            store,
            historical,
            grace_period_secs,
        }
    }

    /// Run one tombstoning pass. A deployment with no historical store
    /// configured is a no-op, returning `(0, 0)`.
    #[tracing::instrument(skip(self))]
    pub async fn tombstone(&self) -> Result<(usize, usize)> {
        let Some(historical) = &self.historical else {
            tracing::debug!("no historical store configured, tombstoner is a no-op");
            return Ok((0, 0));
        };

        // Phase 1: read candidates from the live store.
        let (jobs, allocs) = self
            .store
            .read_tombstone_candidates(self.grace_period_secs, now())
            .await
            .map_err(AllocatorError::StoreError)?;

        if jobs.is_empty() {
            return Ok((0, 0));
        }

        // Phase 2: copy to the historical store. If this fails, phase 3 is
        // skipped entirely — the next run re-reads the same rows and retries;
        // `insert_jobs`/`insert_allocs` must tolerate re-delivery.
        historical
            .insert_jobs(&jobs)
            .await
            .map_err(AllocatorError::StoreError)?;
        historical
            .insert_allocs(&allocs)
            .await
            .map_err(AllocatorError::StoreError)?;

        // Phase 3: delete from the live store. If this fails after phase 2
        // succeeded, the next run re-copies (tolerated) and retries deletion.
        let job_ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        self.store
            .delete_tombstoned(&job_ids)
            .await
            .map_err(AllocatorError::StoreError)?;

        Ok((jobs.len(), allocs.len()))
    }
}
