//! `Engine` is the top-level facade wiring the Allocator, Lifecycle
//! Controller, Expiry Sweeper, Tombstoner, Scheduler, and Emergency Stop
//! together, exposing the operations listed in spec.md §6.3. A gRPC or HTTP
//! layer (out of scope here) would delegate to this the way
//! `bpmn-lite-server`'s gRPC handlers delegate to `BpmnLiteEngine`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::allocator::{AllocationResult, AllocatorEngine};
use crate::collaborators::{BmpController, QuotaManager, SessionManager};
use crate::config::AllocatorConfig;
use crate::emergency::EmergencyStop;
use crate::epoch::EpochRegistry;
use crate::error::{Result, UpdateOutcome};
use crate::expiry::ExpirySweeper;
use crate::lifecycle::LifecycleController;
use crate::scheduler::Scheduler;
use crate::store::{HistoricalStore, Store};
use crate::tombstone::Tombstoner;
use crate::types::{BmpId, JobId, JobState};

pub struct Engine {
    epoch: EpochRegistry,
    lifecycle: Arc<LifecycleController>,
    allocator: Arc<AllocatorEngine>,
    expiry: Arc<ExpirySweeper>,
    tombstoner: Arc<Tombstoner>,
    emergency: Arc<EmergencyStop>,
    scheduler: Scheduler,
    config: AllocatorConfig,
    /// spec.md §9 open question: `updateJob` during emergency stop is a
    /// warn-and-return no-op; this counts how many times that happened.
    emergency_suppressed_updates: Arc<AtomicUsize>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        historical: Option<Arc<dyn HistoricalStore>>,
        bmp: Arc<dyn BmpController>,
        quota: Arc<dyn QuotaManager>,
        sessions: Arc<dyn SessionManager>,
        config: AllocatorConfig,
    ) -> Self {
        let epoch = EpochRegistry::new();
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            bmp.clone(),
            quota.clone(),
            sessions.clone(),
            epoch.clone(),
        ));
        let allocator = Arc::new(AllocatorEngine::new(
            store.clone(),
            epoch.clone(),
            lifecycle.clone(),
            sessions,
            config.allocator_importance_span,
        ));
        let expiry = Arc::new(ExpirySweeper::new(
            store.clone(),
            lifecycle.clone(),
            quota,
            config.max_quota_check_batch,
        ));
        let tombstoner = Arc::new(Tombstoner::new(
            store.clone(),
            historical,
            config.history_grace_period.as_secs() as i64,
        ));
        let emergency = Arc::new(EmergencyStop::new(store, bmp));
        let scheduler = Scheduler::new(emergency.flag());

        Self {
            epoch,
            lifecycle,
            allocator,
            expiry,
            tombstoner,
            emergency,
            scheduler,
            config,
            emergency_suppressed_updates: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn epoch_registry(&self) -> &EpochRegistry {
        &self.epoch
    }

    pub fn emergency_suppressed_updates(&self) -> usize {
        self.emergency_suppressed_updates.load(Ordering::SeqCst)
    }

    /// Start the periodic allocate/expire tasks and the cron tombstone task
    /// (spec.md §4.6). Call once at process startup.
    pub fn start(&self) {
        let allocator = self.allocator.clone();
        self.scheduler.schedule_at_fixed_rate(
            "allocate",
            self.config.allocator_period,
            Arc::new(move || {
                let allocator = allocator.clone();
                Box::pin(async move {
                    if let Err(e) = allocator.allocate().await {
                        tracing::error!(error = %e, "periodic allocate failed");
                    }
                })
            }),
        );

        let expiry = self.expiry.clone();
        self.scheduler.schedule_at_fixed_rate(
            "expire",
            self.config.keepalive_expiry_period,
            Arc::new(move || {
                let expiry = expiry.clone();
                Box::pin(async move {
                    if let Err(e) = expiry.sweep_expired().await {
                        tracing::error!(error = %e, "keepalive sweep failed");
                    }
                    if let Err(e) = expiry.sweep_quota().await {
                        tracing::error!(error = %e, "quota sweep failed");
                    }
                })
            }),
        );

        let tombstoner = self.tombstoner.clone();
        let schedule = self.config.history_schedule.clone();
        if let Err(e) = self.scheduler.schedule_cron(
            "tombstone",
            &schedule,
            Arc::new(move || {
                let tombstoner = tombstoner.clone();
                Box::pin(async move {
                    match tombstoner.tombstone().await {
                        Ok((jobs, allocs)) => {
                            tracing::info!(jobs, allocs, "tombstone pass complete")
                        }
                        Err(e) => tracing::error!(error = %e, "tombstone pass failed"),
                    }
                })
            }),
        ) {
            tracing::error!(error = %e, "failed to schedule tombstone task");
        }
    }

    pub async fn allocate(&self) -> Result<AllocationResult> {
        self.allocator.allocate().await
    }

    /// Runs both the keepalive and quota sweeps (spec.md §4.4 runs both on
    /// the same periodic tick).
    pub async fn expire_jobs(&self) -> Result<Vec<JobId>> {
        let mut destroyed = self.expiry.sweep_expired().await?;
        destroyed.extend(self.expiry.sweep_quota().await?);
        Ok(destroyed)
    }

    pub async fn tombstone(&self) -> Result<(usize, usize)> {
        self.tombstoner.tombstone().await
    }

    pub async fn destroy_job(&self, job_id: JobId, reason: &str) -> Result<()> {
        self.lifecycle.destroy_job(job_id, reason).await
    }

    pub async fn set_power(
        &self,
        job_id: JobId,
        power_on: bool,
        target_state: JobState,
    ) -> Result<HashSet<BmpId>> {
        self.lifecycle.set_power(job_id, power_on, target_state).await
    }

    /// spec.md §9 open question: during emergency stop this warns, bumps
    /// `emergency_suppressed_updates`, and returns without touching the
    /// store — no replay is attempted after recovery.
    pub async fn update_job(
        &self,
        job_id: JobId,
        source_state: JobState,
        target_state: JobState,
    ) -> Result<UpdateOutcome> {
        if self.emergency.is_active() {
            self.emergency_suppressed_updates.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(job_id, "updateJob suppressed: emergency stop active");
            return Ok(UpdateOutcome::Pending);
        }

        let outcome = self.lifecycle.update_job(job_id, source_state, target_state).await?;
        self.lifecycle
            .handle_outcome(job_id, source_state, target_state, outcome)
            .await?;
        Ok(outcome)
    }

    pub fn schedule_allocate_now(&self) -> Result<()> {
        let allocator = self.allocator.clone();
        self.scheduler.schedule_once(Duration::ZERO, move || async move {
            if let Err(e) = allocator.allocate().await {
                tracing::error!(error = %e, "on-demand allocate failed");
            }
        })
    }

    /// spec.md §4.7: cancel all scheduled work, forward to the BMP
    /// controller, and destroy every live job.
    pub async fn emergency_stop(&self) -> Result<usize> {
        self.scheduler.cancel_all();
        self.emergency.trigger().await
    }
}
