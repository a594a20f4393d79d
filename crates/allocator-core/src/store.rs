use anyhow::Result;
use async_trait::async_trait;

use crate::types::*;

/// Persistence trait for all allocator state.
///
/// The Allocator Engine, Lifecycle Controller, Expiry Sweeper, and
/// Tombstoner operate exclusively through this trait, enabling pluggable
/// backends (`MemoryStore` for tests, `PostgresStore` for production) —
/// mirroring `bpmn-lite-core::store::ProcessStore`. Each method is expected
/// to be atomic with respect to concurrent callers; multi-row methods (e.g.
/// `commit_allocation`) perform all of their writes under one transaction
/// on the backing store.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Machines ──

    async fn load_machine(&self, id: MachineId) -> Result<Option<Machine>>;

    /// Coordinates of a specific board, used to resolve an
    /// `AllocationTask`'s `root_board` into a search root.
    async fn board_coords(&self, board_id: BoardId) -> Result<Option<TriadCoords>>;

    // ── Jobs ──

    async fn load_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn update_job_state(&self, id: JobId, state: JobState) -> Result<()>;
    async fn update_job_death(&self, id: JobId, reason: &str, at: Timestamp) -> Result<()>;
    async fn update_job_keepalive(&self, id: JobId, at: Timestamp) -> Result<()>;

    /// All non-destroyed jobs whose `last_keepalive + keepalive_interval < now`.
    async fn expired_job_ids(&self, now: Timestamp) -> Result<Vec<JobId>>;

    /// Up to `limit` non-destroyed job ids, for the quota sweep.
    async fn live_job_ids(&self, limit: usize) -> Result<Vec<JobId>>;

    /// Every non-destroyed job id, uncapped — used only by emergency stop.
    async fn all_live_job_ids(&self) -> Result<Vec<JobId>>;

    // ── Allocation tasks ──

    /// All `AllocationTask` rows for jobs still in `QUEUED`, ordered by
    /// descending importance (ties broken arbitrarily but deterministically).
    async fn queued_tasks(&self) -> Result<Vec<AllocationTask>>;
    async fn create_allocation_task(&self, task: &AllocationTask) -> Result<()>;
    async fn delete_allocation_task(&self, job_id: JobId) -> Result<()>;

    /// Atomically bump the importance of every still-queued task by one.
    async fn bump_importance_all_queued(&self) -> Result<()>;

    // ── Spatial search ──

    /// Any board currently allocated to no job and marked functioning.
    async fn find_free_board(&self, machine_id: MachineId) -> Result<Option<TriadCoords>>;

    /// Candidate roots for a `(w, h)` rectangle, ordered by preference (free
    /// area descending, then deterministic), restricted to a tolerance of
    /// dead boards.
    async fn find_rectangle(
        &self,
        machine_id: MachineId,
        width: i32,
        height: i32,
        tolerance: i32,
    ) -> Result<Vec<TriadCoords>>;

    /// Test one specific root for a `(w, h)` rectangle.
    async fn find_rectangle_at(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        max_dead: i32,
    ) -> Result<Option<TriadCoords>>;

    /// A specific board by coordinates, if free and functioning (ignores
    /// `max_dead_boards`).
    async fn find_specific_board(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
    ) -> Result<Option<BoardId>>;

    /// Number of boards inside the rectangle rooted at `root` reachable from
    /// `root` via enabled links.
    async fn count_connected(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
    ) -> Result<i32>;

    /// The set of reachable board ids within the rectangle, used to commit
    /// an allocation.
    async fn connected_board_ids(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        depth: i32,
    ) -> Result<Vec<BoardId>>;

    /// All links touching any of the given boards (used to compute
    /// perimeter links when powering on).
    async fn links_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<Link>>;

    /// The BMP ids controlling the given boards, deduplicated.
    async fn bmp_ids_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<BmpId>>;

    // ── Allocation commit ──

    /// Mark every board in `board_ids` allocated to `job_id`, set the job's
    /// geometry and root board, and delete its `AllocationTask` — all under
    /// one transaction (spec.md §4.2.3 steps 1–3).
    async fn commit_allocation(
        &self,
        job_id: JobId,
        board_ids: &[BoardId],
        rect: Rectangle,
        root_board: BoardId,
    ) -> Result<()>;

    /// The boards currently allocated to a job.
    async fn allocated_boards(&self, job_id: JobId) -> Result<Vec<BoardId>>;

    /// Clear `allocated_job` on every board held by `job_id`. Only valid
    /// once the job is `DESTROYED` (spec.md §3 invariant 2).
    async fn release_boards(&self, job_id: JobId) -> Result<()>;

    // ── Pending changes ──

    async fn insert_pending_changes(&self, changes: &[PendingChange]) -> Result<()>;

    /// `(n_changes, n_errors)` for the given `(job, source, target)` triple.
    async fn count_pending(
        &self,
        job_id: JobId,
        source: JobState,
        target: JobState,
    ) -> Result<(i64, i64)>;

    async fn delete_pending(
        &self,
        job_id: JobId,
        source: JobState,
        target: JobState,
    ) -> Result<()>;

    /// Total pending-change rows for a job, irrespective of triple — used by
    /// the testable-property check that every `POWER` job has at least one.
    async fn pending_count_for_job(&self, job_id: JobId) -> Result<i64>;

    // ── Tombstoning ──

    /// Read, into memory, every job older than `grace_period` (relative to
    /// `now`) that is `DESTROYED`, plus the allocation rows those jobs once
    /// held. Read-only — does not delete anything.
    async fn read_tombstone_candidates(
        &self,
        grace_period_secs: i64,
        now: Timestamp,
    ) -> Result<(Vec<HistoricalJob>, Vec<HistoricalAlloc>)>;

    /// Delete external references, then the allocation and job rows, for the
    /// given jobs. Called only after the historical store has durably
    /// accepted the copies.
    async fn delete_tombstoned(&self, job_ids: &[JobId]) -> Result<()>;
}

/// The secondary historical store the Tombstoner archives into. A deployment
/// with no historical store configured makes the Tombstoner a no-op
/// (spec.md §4.5).
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// Insert rows, tolerating re-delivery (upsert semantics) — phase 2 of
    /// tombstoning may be retried after a phase-3 failure.
    async fn insert_jobs(&self, jobs: &[HistoricalJob]) -> Result<()>;
    async fn insert_allocs(&self, allocs: &[HistoricalAlloc]) -> Result<()>;
}
