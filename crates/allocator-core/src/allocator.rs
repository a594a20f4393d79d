//! Allocator Engine (spec.md §4.2): the periodic scan over queued
//! allocation requests.

use std::collections::HashSet;
use std::sync::Arc;

use crate::collaborators::SessionManager;
use crate::dims;
use crate::epoch::EpochRegistry;
use crate::error::{AllocatorError, Result};
use crate::lifecycle::LifecycleController;
use crate::store::Store;
use crate::types::*;

/// Outcome of one `allocate()` pass: the jobs that were committed, the
/// machines they landed on, and the BMP ids to notify.
#[derive(Debug, Default, Clone)]
pub struct AllocationResult {
    pub job_ids: Vec<JobId>,
    pub machine_ids: Vec<MachineId>,
    pub bmp_ids: HashSet<BmpId>,
}

/// The shape a queued task resolves to, after classification (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
enum SearchPlan {
    SingleBoard,
    Rectangle {
        width: i32,
        height: i32,
        tolerance: i32,
    },
    RectangleAt {
        root_board: BoardId,
        width: i32,
        height: i32,
        max_dead: i32,
    },
    SpecificBoard {
        root_board: BoardId,
    },
}

/// Classify a queued task into a search plan (spec.md §4.2, first match
/// wins). Pure — takes no store dependency so it's directly unit-testable.
fn classify_task(task: &AllocationTask, machine: &Machine) -> Result<SearchPlan> {
    if let Some(n) = task.num_boards {
        if n > 0 {
            if n == 1 {
                return Ok(SearchPlan::SingleBoard);
            }
            let est = dims::estimate_dimensions(task.job_id, n, machine.max_width, machine.max_height)?;
            return Ok(SearchPlan::Rectangle {
                width: est.width,
                height: est.height,
                tolerance: task.max_dead_boards + est.tolerance,
            });
        }
    }

    if let (Some(width), Some(height), Some(root_board)) = (task.width, task.height, task.root_board) {
        return Ok(SearchPlan::RectangleAt {
            root_board,
            width,
            height,
            max_dead: task.max_dead_boards,
        });
    }

    if let (Some(width), Some(height)) = (task.width, task.height) {
        if width > 0 && height > 0 {
            if width == 1 && height == 1 && task.max_dead_boards == 2 {
                return Ok(SearchPlan::SingleBoard);
            }
            let tolerance =
                dims::explicit_tolerance(task.job_id, width, height, machine.max_width, machine.max_height)?;
            return Ok(SearchPlan::Rectangle {
                width: width.min(machine.max_width),
                height: height.min(machine.max_height),
                tolerance,
            });
        }
    }

    if let Some(root_board) = task.root_board {
        return Ok(SearchPlan::SpecificBoard { root_board });
    }

    Err(AllocatorError::BadRequest {
        job_id: task.job_id,
        reason: "task has no numBoards, width/height, or rootBoard set".to_string(),
    })
}

/// The periodic scan described in spec.md §4.2: selects candidate board
/// sets for queued jobs, validates connectivity, and commits allocations.
pub struct AllocatorEngine {
    store: Arc<dyn Store>,
    epoch: EpochRegistry,
    lifecycle: Arc<LifecycleController>,
    sessions: Arc<dyn SessionManager>,
    importance_span: i64,
}

impl AllocatorEngine {
    pub fn new(
        store: Arc<dyn Store>,
        epoch: EpochRegistry,
        lifecycle: Arc<LifecycleController>,
        sessions: Arc<dyn SessionManager>,
        importance_span: i64,
    ) -> Self {
        Self {
            store,
            epoch,
            lifecycle,
            sessions,
            importance_span,
        }
    }

    /// Run one allocation pass (spec.md §4.2).
    #[tracing::instrument(skip(self))]
    pub async fn allocate(&self) -> Result<AllocationResult> {
        let tasks = self
            .store
            .queued_tasks()
            .await
            .map_err(AllocatorError::StoreError)?;

        let mut result = AllocationResult::default();
        if tasks.is_empty() {
            return Ok(result);
        }

        let max_importance = tasks[0].importance;

        for task in &tasks {
            if task.importance < max_importance - self.importance_span {
                continue;
            }

            match self.try_allocate_task(task).await {
                Ok(Some(bmp_ids)) => {
                    result.job_ids.push(task.job_id);
                    result.machine_ids.push(task.machine_id);
                    result.bmp_ids.extend(bmp_ids);
                }
                Ok(None) => {
                    tracing::debug!(job_id = task.job_id, "no candidate this pass");
                }
                Err(AllocatorError::BadRequest { job_id, reason }) => {
                    tracing::warn!(job_id, reason = %reason, "discarding unallocatable task");
                    if let Err(e) = self.store.delete_allocation_task(job_id).await {
                        tracing::error!(job_id, error = %e, "failed to delete bad allocation task");
                    }
                }
                Err(AllocatorError::StoreBusy(msg)) => {
                    tracing::info!(msg = %msg, "store busy, deferring remainder of scan");
                    return Ok(result);
                }
                Err(e) => return Err(e),
            }
        }

        self.store
            .bump_importance_all_queued()
            .await
            .map_err(AllocatorError::StoreError)?;

        Ok(result)
    }

    async fn try_allocate_task(&self, task: &AllocationTask) -> Result<Option<HashSet<BmpId>>> {
        let machine = self
            .store
            .load_machine(task.machine_id)
            .await
            .map_err(AllocatorError::StoreError)?
            .ok_or_else(|| AllocatorError::BadRequest {
                job_id: task.job_id,
                reason: format!("machine {} not found", task.machine_id),
            })?;

        let plan = classify_task(task, &machine)?;
        let Some((root, rect)) = self.search(task.job_id, &plan, &machine).await? else {
            return Ok(None);
        };

        self.commit(task.job_id, machine.id, root, rect).await
    }

    async fn resolve_root(&self, job_id: JobId, board_id: BoardId) -> Result<TriadCoords> {
        self.store
            .board_coords(board_id)
            .await
            .map_err(AllocatorError::StoreError)?
            .ok_or_else(|| AllocatorError::BadRequest {
                job_id,
                reason: format!("root board {board_id} not found"),
            })
    }

    async fn search(
        &self,
        job_id: JobId,
        plan: &SearchPlan,
        machine: &Machine,
    ) -> Result<Option<(TriadCoords, Rectangle)>> {
        match *plan {
            SearchPlan::SingleBoard => {
                let root = self
                    .store
                    .find_free_board(machine.id)
                    .await
                    .map_err(AllocatorError::StoreError)?;
                Ok(root.map(|r| (r, Rectangle::single_board())))
            }

            SearchPlan::Rectangle { width, height, tolerance } => {
                let candidates = self
                    .store
                    .find_rectangle(machine.id, width, height, tolerance)
                    .await
                    .map_err(AllocatorError::StoreError)?;

                for root in candidates {
                    if self
                        .connectivity_ok(machine.id, root, width, height, tolerance)
                        .await?
                    {
                        return Ok(Some((root, Rectangle::triads(width, height))));
                    }
                }
                Ok(None)
            }

            SearchPlan::RectangleAt { root_board, width, height, max_dead } => {
                let root = self.resolve_root(job_id, root_board).await?;
                let found = self
                    .store
                    .find_rectangle_at(machine.id, root, width, height, max_dead)
                    .await
                    .map_err(AllocatorError::StoreError)?;

                let Some(root) = found else {
                    return Ok(None);
                };
                if self
                    .connectivity_ok(machine.id, root, width, height, max_dead)
                    .await?
                {
                    Ok(Some((root, Rectangle::triads(width, height))))
                } else {
                    Ok(None)
                }
            }

            SearchPlan::SpecificBoard { root_board } => {
                let root = self.resolve_root(job_id, root_board).await?;
                let found = self
                    .store
                    .find_specific_board(machine.id, root)
                    .await
                    .map_err(AllocatorError::StoreError)?;
                Ok(found.map(|_| (root, Rectangle::single_board())))
            }
        }
    }

    /// `connectedSize >= width*height*3 - tolerance` (spec.md §4.2.2),
    /// skipped for a 1x1 footprint where the check is trivially true.
    async fn connectivity_ok(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        tolerance: i32,
    ) -> Result<bool> {
        if width * height <= 1 {
            return Ok(true);
        }
        let connected = self
            .store
            .count_connected(machine_id, root, width, height)
            .await
            .map_err(AllocatorError::StoreError)?;
        let required = width as i64 * height as i64 * 3 - tolerance as i64;
        Ok(connected as i64 >= required)
    }

    /// Commit a validated candidate (spec.md §4.2.3).
    async fn commit(
        &self,
        job_id: JobId,
        machine_id: MachineId,
        root: TriadCoords,
        rect: Rectangle,
    ) -> Result<Option<HashSet<BmpId>>> {
        let board_ids = self
            .store
            .connected_board_ids(machine_id, root, rect.width, rect.height, rect.depth)
            .await
            .map_err(AllocatorError::StoreError)?;

        if board_ids.is_empty() {
            return Ok(None);
        }

        let root_board = board_ids[0];
        self.store
            .commit_allocation(job_id, &board_ids, rect, root_board)
            .await
            .map_err(AllocatorError::StoreError)?;

        self.sessions.close_job(job_id).await;

        let bmp_ids = self.lifecycle.set_power(job_id, true, JobState::Ready).await?;
        self.epoch.job_changed(job_id);

        Ok(Some(bmp_ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_width: i32, max_height: i32) -> Machine {
        Machine {
            id: 1,
            name: "m".into(),
            max_width,
            max_height,
        }
    }

    fn task(job_id: JobId) -> AllocationTask {
        AllocationTask {
            job_id,
            machine_id: 1,
            num_boards: None,
            width: None,
            height: None,
            root_board: None,
            max_dead_boards: 0,
            importance: 0,
        }
    }

    #[test]
    fn num_boards_one_uses_single_board_path() {
        let t = AllocationTask {
            num_boards: Some(1),
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert_eq!(plan, SearchPlan::SingleBoard);
    }

    #[test]
    fn num_boards_many_uses_rectangle_with_combined_tolerance() {
        let t = AllocationTask {
            num_boards: Some(2),
            max_dead_boards: 3,
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert_eq!(
            plan,
            SearchPlan::Rectangle {
                width: 1,
                height: 1,
                tolerance: 4, // estimateTolerance(1) + maxDeadBoards(3)
            }
        );
    }

    #[test]
    fn width_height_root_uses_rectangle_at() {
        let t = AllocationTask {
            width: Some(2),
            height: Some(2),
            root_board: Some(42),
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert_eq!(
            plan,
            SearchPlan::RectangleAt {
                root_board: 42,
                width: 2,
                height: 2,
                max_dead: 0,
            }
        );
    }

    #[test]
    fn one_by_one_with_max_dead_two_is_single_board() {
        let t = AllocationTask {
            width: Some(1),
            height: Some(1),
            max_dead_boards: 2,
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert_eq!(plan, SearchPlan::SingleBoard);
    }

    #[test]
    fn one_by_one_without_max_dead_two_uses_rectangle() {
        let t = AllocationTask {
            width: Some(1),
            height: Some(1),
            max_dead_boards: 0,
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert!(matches!(plan, SearchPlan::Rectangle { .. }));
    }

    #[test]
    fn root_only_uses_specific_board() {
        let t = AllocationTask {
            root_board: Some(7),
            ..task(1)
        };
        let plan = classify_task(&t, &machine(10, 10)).unwrap();
        assert_eq!(plan, SearchPlan::SpecificBoard { root_board: 7 });
    }

    #[test]
    fn no_shape_fields_is_bad_request() {
        let err = classify_task(&task(1), &machine(10, 10)).unwrap_err();
        assert!(matches!(err, AllocatorError::BadRequest { .. }));
    }

    #[test]
    fn negative_tolerance_is_bad_request() {
        let t = AllocationTask {
            num_boards: Some(1000),
            ..task(1)
        };
        let err = classify_task(&t, &machine(2, 2)).unwrap_err();
        assert!(matches!(err, AllocatorError::BadRequest { .. }));
    }

    // ── Integration tests: full allocate() over MemoryStore ──

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

    fn test_job(id: JobId, importance: i64) -> Job {
        Job {
            id,
            machine_id: 1,
            owner: "alice".into(),
            group: "g".into(),
            width: None,
            height: None,
            depth: None,
            root_board: None,
            state: JobState::Queued,
            created_at: 0,
            last_keepalive: 0,
            keepalive_interval_secs: 60,
            keepalive_host: None,
            death_reason: None,
            death_timestamp: None,
            original_request: Vec::new(),
            importance,
        }
    }

    fn engine(store: Arc<MemoryStore>) -> AllocatorEngine {
        let epoch = EpochRegistry::new();
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            Arc::new(NoopBmp),
            Arc::new(NoopQuota),
            Arc::new(NoopSessions),
            epoch.clone(),
        ));
        AllocatorEngine::new(store, epoch, lifecycle, Arc::new(NoopSessions), 10)
    }

    #[tokio::test]
    async fn single_board_happy_path() {
        // spec.md §8 scenario 1: 1x1x1 machine, one free board, numBoards=1.
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine { id: 1, name: "m".into(), max_width: 1, max_height: 1 })
            .await;
        store.add_board(test_board(1, 1, TriadCoords::new(0, 0, 0), 1)).await;
        store.save_job(&test_job(1, 0)).await.unwrap();
        store
            .create_allocation_task(&AllocationTask {
                job_id: 1,
                machine_id: 1,
                num_boards: Some(1),
                width: None,
                height: None,
                root_board: None,
                max_dead_boards: 0,
                importance: 0,
            })
            .await
            .unwrap();

        let eng = engine(store.clone());
        let result = eng.allocate().await.unwrap();

        assert_eq!(result.job_ids, vec![1]);
        assert_eq!(result.bmp_ids, HashSet::from([1]));

        let job = store.load_job(1).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Power);
        assert_eq!(job.root_board, Some(1));
        let (n, _) = store.count_pending(1, JobState::Queued, JobState::Ready).await.unwrap();
        assert_eq!(n, 1);
        assert!(!store.has_allocation_task(1).await);
    }

    #[tokio::test]
    async fn rectangle_with_tolerance_commits_all_connected_boards() {
        // spec.md §8 scenario 2: 1x1x3 machine, three connected boards, numBoards=2.
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine { id: 1, name: "m".into(), max_width: 1, max_height: 1 })
            .await;
        for z in 0..3u8 {
            store
                .add_board(test_board(z as i64 + 1, 1, TriadCoords::new(0, 0, z), 1))
                .await;
        }
        store.add_link(Link { from: 1, to: 2, direction: Direction::N, enabled: true }).await;
        store.add_link(Link { from: 2, to: 3, direction: Direction::N, enabled: true }).await;
        store.save_job(&test_job(1, 0)).await.unwrap();
        store
            .create_allocation_task(&AllocationTask {
                job_id: 1,
                machine_id: 1,
                num_boards: Some(2),
                width: None,
                height: None,
                root_board: None,
                max_dead_boards: 0,
                importance: 0,
            })
            .await
            .unwrap();

        let eng = engine(store.clone());
        let result = eng.allocate().await.unwrap();

        assert_eq!(result.job_ids, vec![1]);
        let job = store.load_job(1).await.unwrap().unwrap();
        assert_eq!((job.width, job.height, job.depth), (Some(1), Some(1), Some(3)));
        assert_eq!(store.allocated_boards(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn starvation_relief_bumps_importance_of_skipped_tasks() {
        // spec.md §8 scenario 3: two tasks at importance 0 and 10, span 5.
        // Neither machine has any free boards, so nothing is allocated, but
        // the low-importance task must still be bumped.
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine { id: 1, name: "m".into(), max_width: 1, max_height: 1 })
            .await;
        store.save_job(&test_job(1, 0)).await.unwrap();
        store.save_job(&test_job(2, 10)).await.unwrap();
        store
            .create_allocation_task(&AllocationTask {
                job_id: 1,
                machine_id: 1,
                num_boards: Some(1),
                width: None,
                height: None,
                root_board: None,
                max_dead_boards: 0,
                importance: 0,
            })
            .await
            .unwrap();
        store
            .create_allocation_task(&AllocationTask {
                job_id: 2,
                machine_id: 1,
                num_boards: Some(1),
                width: None,
                height: None,
                root_board: None,
                max_dead_boards: 0,
                importance: 10,
            })
            .await
            .unwrap();

        let eng = engine(store.clone());
        let result = eng.allocate().await.unwrap();
        assert!(result.job_ids.is_empty());

        let tasks = store.queued_tasks().await.unwrap();
        let importances: std::collections::HashMap<JobId, i64> =
            tasks.iter().map(|t| (t.job_id, t.importance)).collect();
        assert_eq!(importances[&1], 1);
        assert_eq!(importances[&2], 11);
    }

    #[tokio::test]
    async fn bad_request_task_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_machine(Machine { id: 1, name: "m".into(), max_width: 1, max_height: 1 })
            .await;
        store.save_job(&test_job(1, 0)).await.unwrap();
        store
            .create_allocation_task(&AllocationTask {
                job_id: 1,
                machine_id: 1,
                num_boards: None,
                width: None,
                height: None,
                root_board: None,
                max_dead_boards: 0,
                importance: 0,
            })
            .await
            .unwrap();

        let eng = engine(store.clone());
        let result = eng.allocate().await.unwrap();
        assert!(result.job_ids.is_empty());
        assert!(!store.has_allocation_task(1).await);
    }
}
