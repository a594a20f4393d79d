//! Emergency Stop (spec.md §4.7): idempotent, irreversible for the process
//! lifetime — once tripped, no further allocation or power work is issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::collaborators::BmpController;
use crate::error::{AllocatorError, Result};
use crate::store::Store;
use crate::types::{death_reasons, now, JobId};

pub struct EmergencyStop {
    flag: Arc<AtomicBool>,
    store: Arc<dyn Store>,
    bmp: Arc<dyn BmpController>,
}

impl EmergencyStop {
    pub fn new(store: Arc<dyn Store>, bmp: Arc<dyn BmpController>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            store,
            bmp,
        }
    }

    /// The shared flag, handed to the `Scheduler` so periodic/one-shot work
    /// refuses once this trips.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip emergency stop. Idempotent: a second call forwards to the BMP
    /// controller again (harmless) but does no further job destruction work
    /// since `all_live_job_ids` will by then return nothing.
    #[tracing::instrument(skip(self))]
    pub async fn trigger(&self) -> Result<usize> {
        self.flag.store(true, Ordering::SeqCst);
        self.bmp.emergency_stop().await;

        let live = self
            .store
            .all_live_job_ids()
            .await
            .map_err(AllocatorError::StoreError)?;

        let mut destroyed = 0;
        for job_id in live {
            match self.destroy_without_power(job_id).await {
                Ok(()) => destroyed += 1,
                Err(e) => tracing::error!(job_id, error = %e, "failed to destroy job during emergency stop"),
            }
        }
        Ok(destroyed)
    }

    /// Destroy a job directly in the store, skipping `set_power` entirely —
    /// no further power changes are issued once emergency stop has tripped.
    async fn destroy_without_power(&self, job_id: JobId) -> Result<()> {
        self.store
            .update_job_death(job_id, death_reasons::EMERGENCY_STOP, now())
            .await
            .map_err(AllocatorError::StoreError)?;
        self.store
            .release_boards(job_id)
            .await
            .map_err(AllocatorError::StoreError)?;
        self.store
            .delete_allocation_task(job_id)
            .await
            .map_err(AllocatorError::StoreError)?;
        self.store
            .update_job_state(job_id, crate::types::JobState::Destroyed)
            .await
            .map_err(AllocatorError::StoreError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingBmp(AtomicUsize);

    #[async_trait]
    impl BmpController for CountingBmp {
        async fn trigger_search(&self, _bmp_ids: &[BmpId]) {}
        async fn emergency_stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn live_job(id: JobId) -> Job {
        Job {
            id,
            machine_id: 1,
            owner: "alice".into(),
            group: "g".into(),
            width: Some(1),
            height: Some(1),
            depth: Some(1),
            root_board: Some(id + 100),
            state: JobState::Ready,
            created_at: 0,
            last_keepalive: 0,
            keepalive_interval_secs: 60,
            keepalive_host: None,
            death_reason: None,
            death_timestamp: None,
            original_request: Vec::new(),
            importance: 0,
        }
    }

    #[tokio::test]
    async fn trigger_destroys_every_live_job_and_forwards_to_bmp() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&live_job(1)).await.unwrap();
        store.save_job(&live_job(2)).await.unwrap();
        store
            .save_job(&Job { state: JobState::Destroyed, ..live_job(3) })
            .await
            .unwrap();

        let bmp = Arc::new(CountingBmp(AtomicUsize::new(0)));
        let stop = EmergencyStop::new(store.clone(), bmp.clone());

        let n = stop.trigger().await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(bmp.0.load(Ordering::SeqCst), 1);
        assert!(stop.is_active());

        assert_eq!(store.load_job(1).await.unwrap().unwrap().state, JobState::Destroyed);
        assert_eq!(store.load_job(2).await.unwrap().unwrap().state, JobState::Destroyed);
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&live_job(1)).await.unwrap();
        let bmp = Arc::new(CountingBmp(AtomicUsize::new(0)));
        let stop = EmergencyStop::new(store.clone(), bmp.clone());

        stop.trigger().await.unwrap();
        let second = stop.trigger().await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(bmp.0.load(Ordering::SeqCst), 2);
    }
}
