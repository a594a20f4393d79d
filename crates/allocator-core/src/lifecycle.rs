//! Job Lifecycle Controller (spec.md §4.3).
//!
//! Owns the two operations that move a job through `QUEUED → POWER → READY`
//! and any state `→ DESTROYED`: issuing power changes as `PendingChange` rows
//! for the external BMP controller to act on, and reconciling completions the
//! BMP controller reports back through `update_job`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::collaborators::{BmpController, QuotaManager, SessionManager};
use crate::epoch::EpochRegistry;
use crate::error::{AllocatorError, Result, UpdateOutcome};
use crate::store::Store;
use crate::types::*;

/// Reconstruct a queued job's desired shape from its last committed
/// geometry, for re-queueing after a power transition fails. A single-board
/// job (`depth == 1`) goes back through the `numBoards == 1` classification
/// path; a triad rectangle goes back through `RectangleAt`, biased toward
/// its previous root board. Returns `None` if the job was never committed
/// (no geometry to rebuild from).
fn rebuild_allocation_task(job: &Job) -> Option<AllocationTask> {
    let width = job.width?;
    let height = job.height?;
    let depth = job.depth?;

    let base = AllocationTask {
        job_id: job.id,
        machine_id: job.machine_id,
        num_boards: None,
        width: None,
        height: None,
        root_board: job.root_board,
        max_dead_boards: 0,
        importance: 0,
    };
    if depth == 1 {
        Some(AllocationTask {
            num_boards: Some(1),
            ..base
        })
    } else {
        Some(AllocationTask {
            width: Some(width),
            height: Some(height),
            ..base
        })
    }
}

pub struct LifecycleController {
    store: Arc<dyn Store>,
    bmp: Arc<dyn BmpController>,
    quota: Arc<dyn QuotaManager>,
    sessions: Arc<dyn SessionManager>,
    epoch: EpochRegistry,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn Store>,
        bmp: Arc<dyn BmpController>,
        quota: Arc<dyn QuotaManager>,
        sessions: Arc<dyn SessionManager>,
        epoch: EpochRegistry,
    ) -> Self {
        Self {
            store,
            bmp,
            quota,
            sessions,
            epoch,
        }
    }

    /// Issue a power change for a job's currently allocated boards
    /// (spec.md §4.3.1). Triggers the BMP controller's search for the
    /// touched BMPs before returning their ids.
    pub async fn set_power(
        &self,
        job_id: JobId,
        power_on: bool,
        target_state: JobState,
    ) -> Result<HashSet<BmpId>> {
        let job = self
            .store
            .load_job(job_id)
            .await
            .map_err(AllocatorError::StoreError)?
            .ok_or_else(|| AllocatorError::BadRequest {
                job_id,
                reason: "job not found".to_string(),
            })?;
        let source_state = job.state;

        let boards = self
            .store
            .allocated_boards(job_id)
            .await
            .map_err(AllocatorError::StoreError)?;

        if boards.is_empty() {
            self.store
                .update_job_state(job_id, target_state)
                .await
                .map_err(AllocatorError::StoreError)?;
            self.epoch.job_changed(job_id);
            return Ok(HashSet::new());
        }

        let allocated: HashSet<BoardId> = boards.iter().copied().collect();

        let changes: Vec<PendingChange> = if power_on {
            let links = self
                .store
                .links_for_boards(&boards)
                .await
                .map_err(AllocatorError::StoreError)?;
            boards
                .iter()
                .map(|&board_id| {
                    let mut enables = DirectionEnables::all_enabled();
                    for link in links.iter().filter(|l| l.from == board_id) {
                        if !allocated.contains(&link.to) {
                            // Perimeter link: keep it off to isolate the allocation.
                            enables.set(link.direction, false);
                        }
                    }
                    PendingChange {
                        job_id,
                        board_id,
                        power_on: true,
                        enables,
                        source_state,
                        target_state,
                        in_progress: false,
                        errored: false,
                    }
                })
                .collect()
        } else {
            boards
                .iter()
                .map(|&board_id| PendingChange {
                    job_id,
                    board_id,
                    power_on: false,
                    enables: DirectionEnables::all_disabled(),
                    source_state,
                    target_state,
                    in_progress: false,
                    errored: false,
                })
                .collect()
        };

        self.store
            .insert_pending_changes(&changes)
            .await
            .map_err(AllocatorError::StoreError)?;

        if target_state == JobState::Destroyed {
            self.store
                .update_job_state(job_id, JobState::Destroyed)
                .await
                .map_err(AllocatorError::StoreError)?;
        } else if !changes.is_empty() {
            self.store
                .update_job_state(job_id, JobState::Power)
                .await
                .map_err(AllocatorError::StoreError)?;
        } else {
            self.store
                .update_job_state(job_id, target_state)
                .await
                .map_err(AllocatorError::StoreError)?;
        }
        self.epoch.job_changed(job_id);

        let bmp_ids = self
            .store
            .bmp_ids_for_boards(&boards)
            .await
            .map_err(AllocatorError::StoreError)?;
        self.bmp.trigger_search(&bmp_ids).await;

        Ok(bmp_ids.into_iter().collect())
    }

    /// Reconcile the completion of some `(job, source, target)` pending
    /// changes (spec.md §4.3.2). Called by the BMP controller's completion
    /// callback. Performs the store-visible part of the reconciliation and
    /// returns a tag describing what happened; `RequeueNeeded` and
    /// `DestroyNeeded` hand a follow-up action back to the caller to run as
    /// its own transaction, rather than nesting one here.
    #[tracing::instrument(skip(self), fields(job_id, ?source_state, ?target_state))]
    pub async fn update_job(
        &self,
        job_id: JobId,
        source_state: JobState,
        target_state: JobState,
    ) -> Result<UpdateOutcome> {
        let (n_changes, n_errors) = self
            .store
            .count_pending(job_id, source_state, target_state)
            .await
            .map_err(AllocatorError::StoreError)?;

        if n_errors > 0 && n_errors == n_changes {
            self.store
                .delete_pending(job_id, source_state, target_state)
                .await
                .map_err(AllocatorError::StoreError)?;

            if target_state == JobState::Destroyed {
                self.store
                    .update_job_state(job_id, target_state)
                    .await
                    .map_err(AllocatorError::StoreError)?;
                self.epoch.job_changed(job_id);
                return Ok(UpdateOutcome::Updated);
            }
            if target_state == JobState::Queued {
                self.requeue_job(job_id).await?;
                self.epoch.job_changed(job_id);
                return Ok(UpdateOutcome::Updated);
            }
            if source_state == JobState::Ready {
                tracing::warn!(job_id, "power operation failed on a live job, destroying");
                return Ok(UpdateOutcome::DestroyNeeded {
                    reason: "power operation failed",
                });
            }
            tracing::info!(job_id, "power-up failed, re-queueing");
            return Ok(UpdateOutcome::RequeueNeeded);
        }

        if n_changes > 0 {
            return Ok(UpdateOutcome::Pending);
        }

        match target_state {
            JobState::Destroyed => {
                self.store
                    .release_boards(job_id)
                    .await
                    .map_err(AllocatorError::StoreError)?;
            }
            JobState::Ready => {
                self.store
                    .delete_allocation_task(job_id)
                    .await
                    .map_err(AllocatorError::StoreError)?;
                self.store
                    .update_job_state(job_id, JobState::Ready)
                    .await
                    .map_err(AllocatorError::StoreError)?;
            }
            JobState::Queued => {
                self.requeue_job(job_id).await?;
            }
            _ => {
                self.store
                    .update_job_state(job_id, target_state)
                    .await
                    .map_err(AllocatorError::StoreError)?;
            }
        }
        self.epoch.job_changed(job_id);
        Ok(UpdateOutcome::Updated)
    }

    /// Release a job's boards and put it back in the allocation queue,
    /// recreating its `AllocationTask` from the shape it last held
    /// (spec.md §8 scenario 5). Called whenever a job's power transition
    /// lands it back in `QUEUED`, whether cleanly or after an errored
    /// power-on.
    async fn requeue_job(&self, job_id: JobId) -> Result<()> {
        let job = self
            .store
            .load_job(job_id)
            .await
            .map_err(AllocatorError::StoreError)?
            .ok_or_else(|| AllocatorError::BadRequest {
                job_id,
                reason: "job not found".to_string(),
            })?;

        self.store
            .release_boards(job_id)
            .await
            .map_err(AllocatorError::StoreError)?;

        if let Some(task) = rebuild_allocation_task(&job) {
            self.store
                .create_allocation_task(&task)
                .await
                .map_err(AllocatorError::StoreError)?;
        } else {
            tracing::warn!(job_id, "requeued job has no prior shape to rebuild a task from");
        }

        self.store
            .update_job_state(job_id, JobState::Queued)
            .await
            .map_err(AllocatorError::StoreError)?;
        Ok(())
    }

    /// Carry out the follow-up action implied by an `update_job` outcome.
    /// Runs as its own operation, never nested inside the transaction that
    /// produced the outcome (spec.md §5).
    pub async fn handle_outcome(
        &self,
        job_id: JobId,
        source_state: JobState,
        target_state: JobState,
        outcome: UpdateOutcome,
    ) -> Result<()> {
        match outcome {
            UpdateOutcome::RequeueNeeded => {
                let _ = source_state;
                let _ = target_state;
                self.set_power(job_id, false, JobState::Queued).await?;
                Ok(())
            }
            UpdateOutcome::DestroyNeeded { reason } => self.destroy_job(job_id, reason).await,
            UpdateOutcome::Updated | UpdateOutcome::Pending => Ok(()),
        }
    }

    /// Destroy a job (spec.md §4.3.3). A no-op if already `DESTROYED`.
    pub async fn destroy_job(&self, job_id: JobId, reason: &str) -> Result<()> {
        let job = self
            .store
            .load_job(job_id)
            .await
            .map_err(AllocatorError::StoreError)?
            .ok_or_else(|| AllocatorError::BadRequest {
                job_id,
                reason: "job not found".to_string(),
            })?;

        if job.state.is_destroyed() {
            return Ok(());
        }

        self.store
            .update_job_death(job_id, reason, now())
            .await
            .map_err(AllocatorError::StoreError)?;

        let power_result = self.set_power(job_id, false, JobState::Destroyed).await;

        let task_result = self
            .store
            .delete_allocation_task(job_id)
            .await
            .map_err(AllocatorError::StoreError);

        self.quota.finish_job(job_id).await;
        self.sessions.close_job(job_id).await;

        power_result?;
        task_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::noop::{NoopBmp, NoopQuota, NoopSessions};
    use crate::store_memory::MemoryStore;
    use std::net::Ipv4Addr;

    fn test_board(id: BoardId, machine_id: MachineId, coords: TriadCoords, bmp_id: BmpId) -> Board {
        Board {
            id,
            machine_id,
            coords,
            ipv4: Ipv4Addr::new(10, 0, 0, id as u8),
            bmp_id,
            functioning: true,
            allocated_job: None,
        }
    }

    fn controller(store: Arc<MemoryStore>) -> LifecycleController {
        LifecycleController::new(
            store,
            Arc::new(NoopBmp),
            Arc::new(NoopQuota),
            Arc::new(NoopSessions),
            EpochRegistry::new(),
        )
    }

    fn job(id: JobId, state: JobState) -> Job {
        Job {
            id,
            machine_id: 1,
            owner: "alice".into(),
            group: "g".into(),
            width: Some(1),
            height: Some(1),
            depth: Some(1),
            root_board: Some(100),
            state,
            created_at: 0,
            last_keepalive: 0,
            keepalive_interval_secs: 60,
            keepalive_host: None,
            death_reason: None,
            death_timestamp: None,
            original_request: vec![],
            importance: 0,
        }
    }

    #[tokio::test]
    async fn set_power_on_with_no_boards_sets_state_directly() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&job(1, JobState::Queued)).await.unwrap();
        let ctl = controller(store.clone());

        let bmps = ctl.set_power(1, true, JobState::Ready).await.unwrap();
        assert!(bmps.is_empty());
        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Ready);
    }

    #[tokio::test]
    async fn set_power_on_with_boards_enqueues_changes_and_moves_to_power() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine {
                id: 1,
                name: "m".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        store
            .add_board(test_board(10, 1, TriadCoords::new(0, 0, 0), 1))
            .await;
        store
            .add_board(test_board(11, 1, TriadCoords::new(0, 0, 1), 1))
            .await;
        store
            .add_link(Link {
                from: 10,
                to: 11,
                direction: Direction::S,
                enabled: true,
            })
            .await;
        store
            .commit_allocation(1, &[10, 11], Rectangle::triads(1, 1), 10)
            .await
            .unwrap();
        store.save_job(&job(1, JobState::Queued)).await.unwrap();

        let ctl = controller(store.clone());
        let bmps = ctl.set_power(1, true, JobState::Ready).await.unwrap();
        assert_eq!(bmps, HashSet::from([1]));

        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Power);
        let (n, _) = store
            .count_pending(1, JobState::Queued, JobState::Ready)
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn update_job_with_no_pending_and_target_ready_finishes() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&job(1, JobState::Power)).await.unwrap();
        let ctl = controller(store.clone());

        let outcome = ctl
            .update_job(1, JobState::Queued, JobState::Ready)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Ready);
    }

    #[tokio::test]
    async fn update_job_all_errors_on_ready_source_needs_destroy() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&job(1, JobState::Power)).await.unwrap();
        store
            .insert_pending_changes(&[PendingChange {
                job_id: 1,
                board_id: 10,
                power_on: false,
                enables: DirectionEnables::all_disabled(),
                source_state: JobState::Ready,
                target_state: JobState::Power,
                in_progress: true,
                errored: true,
            }])
            .await
            .unwrap();

        let ctl = controller(store.clone());
        let outcome = ctl
            .update_job(1, JobState::Ready, JobState::Power)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::DestroyNeeded { .. }));
    }

    #[tokio::test]
    async fn power_on_failure_requeues_with_a_recreated_allocation_task() {
        // spec.md §8 scenario 5: every pending change errors while powering
        // a QUEUED job up. The job must come back to QUEUED holding exactly
        // one AllocationTask, with its boards released back to the pool.
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine {
                id: 1,
                name: "m".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        store
            .add_board(test_board(10, 1, TriadCoords::new(0, 0, 0), 1))
            .await;
        store
            .commit_allocation(1, &[10], Rectangle::single_board(), 10)
            .await
            .unwrap();
        let mut j = job(1, JobState::Power);
        j.width = Some(1);
        j.height = Some(1);
        j.depth = Some(1);
        j.root_board = Some(10);
        store.save_job(&j).await.unwrap();
        store
            .insert_pending_changes(&[PendingChange {
                job_id: 1,
                board_id: 10,
                power_on: true,
                enables: DirectionEnables::all_enabled(),
                source_state: JobState::Queued,
                target_state: JobState::Power,
                in_progress: true,
                errored: true,
            }])
            .await
            .unwrap();

        let ctl = controller(store.clone());
        let outcome = ctl
            .update_job(1, JobState::Queued, JobState::Power)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::RequeueNeeded));

        ctl.handle_outcome(1, JobState::Queued, JobState::Power, outcome)
            .await
            .unwrap();

        // Still mid power-off: boards are untouched and no task exists yet.
        assert_eq!(store.allocated_boards(1).await.unwrap(), vec![10]);
        assert!(!store.has_allocation_task(1).await);

        // Simulate the BMP controller completing the power-off cleanly.
        store
            .delete_pending(1, JobState::Power, JobState::Queued)
            .await
            .unwrap();
        let outcome = ctl
            .update_job(1, JobState::Power, JobState::Queued)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);

        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Queued);
        assert!(store.allocated_boards(1).await.unwrap().is_empty());
        assert!(store.has_allocation_task(1).await);
    }

    #[tokio::test]
    async fn destroy_job_on_already_destroyed_is_noop() {
        let store = Arc::new(MemoryStore::new());
        store.save_job(&job(1, JobState::Destroyed)).await.unwrap();
        let ctl = controller(store.clone());
        ctl.destroy_job(1, "whatever").await.unwrap();
        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.death_reason, None);
    }

    #[tokio::test]
    async fn destroy_job_records_reason_and_powers_off() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine {
                id: 1,
                name: "m".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        store
            .add_board(test_board(10, 1, TriadCoords::new(0, 0, 0), 1))
            .await;
        store
            .commit_allocation(1, &[10], Rectangle::single_board(), 10)
            .await
            .unwrap();
        store.save_job(&job(1, JobState::Ready)).await.unwrap();

        let ctl = controller(store.clone());
        ctl.destroy_job(1, death_reasons::QUOTA_EXCEEDED).await.unwrap();

        let reloaded = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Destroyed);
        assert_eq!(reloaded.death_reason.as_deref(), Some(death_reasons::QUOTA_EXCEEDED));
        assert!(!store.has_allocation_task(1).await);
    }
}
