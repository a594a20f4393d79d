//! Expiry / Quota Sweeper (spec.md §4.4).

use std::sync::Arc;

use crate::collaborators::QuotaManager;
use crate::error::{AllocatorError, Result};
use crate::lifecycle::LifecycleController;
use crate::store::Store;
use crate::types::{death_reasons, now, JobId};

pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleController>,
    quota: Arc<dyn QuotaManager>,
    max_quota_check_batch: usize,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: Arc<LifecycleController>,
        quota: Arc<dyn QuotaManager>,
        max_quota_check_batch: usize,
    ) -> Self {
        Self {
            store,
            lifecycle,
            quota,
            max_quota_check_batch,
        }
    }

    /// Destroy every non-destroyed job whose keepalive has lapsed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<Vec<JobId>> {
        let expired = self
            .store
            .expired_job_ids(now())
            .await
            .map_err(AllocatorError::StoreError)?;

        let mut destroyed = Vec::with_capacity(expired.len());
        for job_id in expired {
            match self
                .lifecycle
                .destroy_job(job_id, death_reasons::KEEPALIVE_EXPIRED)
                .await
            {
                Ok(()) => destroyed.push(job_id),
                Err(e) => tracing::error!(job_id, error = %e, "failed to destroy expired job"),
            }
        }
        Ok(destroyed)
    }

    /// Destroy every live job the external quota manager flags.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_quota(&self) -> Result<Vec<JobId>> {
        let live = self
            .store
            .live_job_ids(self.max_quota_check_batch)
            .await
            .map_err(AllocatorError::StoreError)?;

        let mut destroyed = Vec::new();
        for job_id in live {
            if self.quota.should_kill_job(job_id).await {
                match self
                    .lifecycle
                    .destroy_job(job_id, death_reasons::QUOTA_EXCEEDED)
                    .await
                {
                    Ok(()) => destroyed.push(job_id),
                    Err(e) => tracing::error!(job_id, error = %e, "failed to destroy over-quota job"),
                }
            }
        }
        Ok(destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::noop::{NoopBmp, NoopSessions};
    use crate::epoch::EpochRegistry;
    use crate::types::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct KillList(Mutex<HashSet<JobId>>);

    #[async_trait]
    impl QuotaManager for KillList {
        async fn should_kill_job(&self, job_id: JobId) -> bool {
            self.0.lock().unwrap().contains(&job_id)
        }
        async fn finish_job(&self, _job_id: JobId) {}
    }

    fn test_job(id: JobId, last_keepalive: Timestamp, interval_secs: i64) -> Job {
        Job {
            id,
            machine_id: 1,
            owner: "alice".into(),
            group: "g".into(),
            width: None,
            height: None,
            depth: None,
            root_board: None,
            state: JobState::Ready,
            created_at: 0,
            last_keepalive,
            keepalive_interval_secs: interval_secs,
            keepalive_host: None,
            death_reason: None,
            death_timestamp: None,
            original_request: Vec::new(),
            importance: 0,
        }
    }

    fn sweeper(store: Arc<crate::store_memory::MemoryStore>, quota: Arc<dyn QuotaManager>) -> ExpirySweeper {
        let epoch = EpochRegistry::new();
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            Arc::new(NoopBmp),
            quota.clone(),
            Arc::new(NoopSessions),
            epoch,
        ));
        ExpirySweeper::new(store, lifecycle, quota, 100_000)
    }

    #[tokio::test]
    async fn expired_keepalive_destroys_job() {
        // spec.md §8 scenario 4.
        let store = Arc::new(crate::store_memory::MemoryStore::new());
        let t0 = now();
        store
            .save_job(&test_job(1, t0 - 61_000, 60))
            .await
            .unwrap();

        let sweep = sweeper(store.clone(), Arc::new(KillList(Mutex::new(HashSet::new()))));
        let destroyed = sweep.sweep_expired().await.unwrap();
        assert_eq!(destroyed, vec![1]);

        let job = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Destroyed);
        assert_eq!(job.death_reason.as_deref(), Some(death_reasons::KEEPALIVE_EXPIRED));
    }

    #[tokio::test]
    async fn fresh_keepalive_is_untouched() {
        let store = Arc::new(crate::store_memory::MemoryStore::new());
        store.save_job(&test_job(1, now(), 3600)).await.unwrap();

        let sweep = sweeper(store.clone(), Arc::new(KillList(Mutex::new(HashSet::new()))));
        let destroyed = sweep.sweep_expired().await.unwrap();
        assert!(destroyed.is_empty());
        assert_eq!(store.load_job(1).await.unwrap().unwrap().state, JobState::Ready);
    }

    #[tokio::test]
    async fn quota_sweep_destroys_flagged_jobs_only() {
        let store = Arc::new(crate::store_memory::MemoryStore::new());
        store.save_job(&test_job(1, now(), 3600)).await.unwrap();
        store.save_job(&test_job(2, now(), 3600)).await.unwrap();

        let quota = Arc::new(KillList(Mutex::new(HashSet::from([2]))));
        let sweep = sweeper(store.clone(), quota);
        let destroyed = sweep.sweep_quota().await.unwrap();

        assert_eq!(destroyed, vec![2]);
        assert_eq!(store.load_job(1).await.unwrap().unwrap().state, JobState::Ready);
        assert_eq!(store.load_job(2).await.unwrap().unwrap().state, JobState::Destroyed);
    }
}
