use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::store::{HistoricalStore, Store};
use crate::types::*;

struct Inner {
    machines: HashMap<MachineId, Machine>,
    boards: HashMap<BoardId, Board>,
    links: Vec<Link>,
    jobs: HashMap<JobId, Job>,
    tasks: HashMap<JobId, AllocationTask>,
    pending: Vec<PendingChange>,
}

/// In-memory implementation of `Store`, used throughout the test suite the
/// way `bpmn-lite-core::store_memory::MemoryStore` is used there. Not
/// suitable for production — no durability, no cross-process sharing.
pub struct MemoryStore {
    inner: tokio::sync::RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Inner {
                machines: HashMap::new(),
                boards: HashMap::new(),
                links: Vec::new(),
                jobs: HashMap::new(),
                tasks: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }

    // ── Test/bootstrap helpers — machine topology is provisioned
    //    externally and never mutated by the core (spec.md §3). ──

    pub async fn add_machine(&self, machine: Machine) {
        self.inner.write().await.machines.insert(machine.id, machine);
    }

    pub async fn add_board(&self, board: Board) {
        self.inner.write().await.boards.insert(board.id, board);
    }

    pub async fn add_link(&self, link: Link) {
        self.inner.write().await.links.push(link);
    }

    pub async fn board(&self, id: BoardId) -> Option<Board> {
        self.inner.read().await.boards.get(&id).cloned()
    }

    pub async fn has_allocation_task(&self, job_id: JobId) -> bool {
        self.inner.read().await.tasks.contains_key(&job_id)
    }
}

fn within_rect(board: &Board, machine_id: MachineId, root: TriadCoords, w: i32, h: i32, depth: i32) -> bool {
    if board.machine_id != machine_id {
        return false;
    }
    let c = board.coords;
    let in_xy = c.x >= root.x && c.x < root.x + w && c.y >= root.y && c.y < root.y + h;
    if !in_xy {
        return false;
    }
    if depth == 3 {
        true
    } else {
        c.z == root.z
    }
}

fn connected_from(
    boards: &HashMap<BoardId, Board>,
    links: &[Link],
    machine_id: MachineId,
    root: TriadCoords,
    w: i32,
    h: i32,
    depth: i32,
) -> Vec<BoardId> {
    let root_board = boards
        .values()
        .find(|b| b.machine_id == machine_id && b.coords == root && b.functioning);
    let Some(root_board) = root_board else {
        return Vec::new();
    };

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(root_board.id);
    queue.push_back(root_board.id);

    while let Some(current) = queue.pop_front() {
        for link in links.iter().filter(|l| l.enabled && l.from == current) {
            if visited.contains(&link.to) {
                continue;
            }
            let Some(target) = boards.get(&link.to) else {
                continue;
            };
            if !target.functioning || !within_rect(target, machine_id, root, w, h, depth) {
                continue;
            }
            visited.insert(target.id);
            queue.push_back(target.id);
        }
    }

    let mut ids: Vec<BoardId> = visited.into_iter().collect();
    ids.sort_unstable();
    ids
}

#[async_trait]
impl Store for MemoryStore {
    // ── Machines ──

    async fn load_machine(&self, id: MachineId) -> Result<Option<Machine>> {
        Ok(self.inner.read().await.machines.get(&id).cloned())
    }

    async fn board_coords(&self, board_id: BoardId) -> Result<Option<TriadCoords>> {
        Ok(self.inner.read().await.boards.get(&board_id).map(|b| b.coords))
    }

    // ── Jobs ──

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job_state(&self, id: JobId, state: JobState) -> Result<()> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job not found: {id}"))?;
        job.state = state;
        Ok(())
    }

    async fn update_job_death(&self, id: JobId, reason: &str, at: Timestamp) -> Result<()> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job not found: {id}"))?;
        job.death_reason = Some(reason.to_string());
        job.death_timestamp = Some(at);
        Ok(())
    }

    async fn update_job_keepalive(&self, id: JobId, at: Timestamp) -> Result<()> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job not found: {id}"))?;
        job.last_keepalive = at;
        Ok(())
    }

    async fn expired_job_ids(&self, now: Timestamp) -> Result<Vec<JobId>> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .values()
            .filter(|j| {
                !j.state.is_destroyed()
                    && j.last_keepalive + j.keepalive_interval_secs * 1000 < now
            })
            .map(|j| j.id)
            .collect())
    }

    async fn live_job_ids(&self, limit: usize) -> Result<Vec<JobId>> {
        let r = self.inner.read().await;
        let mut ids: Vec<JobId> = r
            .jobs
            .values()
            .filter(|j| !j.state.is_destroyed())
            .map(|j| j.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn all_live_job_ids(&self) -> Result<Vec<JobId>> {
        let r = self.inner.read().await;
        let mut ids: Vec<JobId> = r
            .jobs
            .values()
            .filter(|j| !j.state.is_destroyed())
            .map(|j| j.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // ── Allocation tasks ──

    async fn queued_tasks(&self) -> Result<Vec<AllocationTask>> {
        let r = self.inner.read().await;
        let mut tasks: Vec<AllocationTask> = r
            .tasks
            .values()
            .filter(|t| {
                r.jobs
                    .get(&t.job_id)
                    .map(|j| j.state == JobState::Queued)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.importance.cmp(&a.importance).then(a.job_id.cmp(&b.job_id)));
        Ok(tasks)
    }

    async fn create_allocation_task(&self, task: &AllocationTask) -> Result<()> {
        self.inner.write().await.tasks.insert(task.job_id, task.clone());
        Ok(())
    }

    async fn delete_allocation_task(&self, job_id: JobId) -> Result<()> {
        self.inner.write().await.tasks.remove(&job_id);
        Ok(())
    }

    async fn bump_importance_all_queued(&self) -> Result<()> {
        let mut w = self.inner.write().await;
        for task in w.tasks.values_mut() {
            task.importance += 1;
        }
        Ok(())
    }

    // ── Spatial search ──

    async fn find_free_board(&self, machine_id: MachineId) -> Result<Option<TriadCoords>> {
        let r = self.inner.read().await;
        let mut candidates: Vec<&Board> = r
            .boards
            .values()
            .filter(|b| b.machine_id == machine_id && b.functioning && b.allocated_job.is_none())
            .collect();
        candidates.sort_by_key(|b| (b.coords.x, b.coords.y, b.coords.z));
        Ok(candidates.first().map(|b| b.coords))
    }

    async fn find_rectangle(
        &self,
        machine_id: MachineId,
        width: i32,
        height: i32,
        tolerance: i32,
    ) -> Result<Vec<TriadCoords>> {
        let r = self.inner.read().await;
        let Some(machine) = r.machines.get(&machine_id) else {
            return Ok(Vec::new());
        };
        let capacity = width as i64 * height as i64 * 3;
        let mut scored: Vec<(i64, TriadCoords)> = Vec::new();

        if width > machine.max_width || height > machine.max_height {
            return Ok(Vec::new());
        }

        for x0 in 0..=(machine.max_width - width) {
            for y0 in 0..=(machine.max_height - height) {
                let root = TriadCoords::new(x0, y0, 0);
                let free = r
                    .boards
                    .values()
                    .filter(|b| {
                        within_rect(b, machine_id, root, width, height, 3)
                            && b.functioning
                            && b.allocated_job.is_none()
                    })
                    .count() as i64;
                if free >= capacity - tolerance as i64 {
                    scored.push((free, root));
                }
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then((a.1.x, a.1.y).cmp(&(b.1.x, b.1.y))));
        Ok(scored.into_iter().map(|(_, root)| root).collect())
    }

    async fn find_rectangle_at(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        max_dead: i32,
    ) -> Result<Option<TriadCoords>> {
        let r = self.inner.read().await;
        let capacity = width as i64 * height as i64 * 3;
        let free = r
            .boards
            .values()
            .filter(|b| {
                within_rect(b, machine_id, root, width, height, 3)
                    && b.functioning
                    && b.allocated_job.is_none()
            })
            .count() as i64;
        if free >= capacity - max_dead as i64 {
            Ok(Some(root))
        } else {
            Ok(None)
        }
    }

    async fn find_specific_board(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
    ) -> Result<Option<BoardId>> {
        let r = self.inner.read().await;
        Ok(r.boards
            .values()
            .find(|b| {
                b.machine_id == machine_id
                    && b.coords == root
                    && b.functioning
                    && b.allocated_job.is_none()
            })
            .map(|b| b.id))
    }

    async fn count_connected(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
    ) -> Result<i32> {
        let r = self.inner.read().await;
        Ok(connected_from(&r.boards, &r.links, machine_id, root, width, height, 3).len() as i32)
    }

    async fn connected_board_ids(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        depth: i32,
    ) -> Result<Vec<BoardId>> {
        let r = self.inner.read().await;
        Ok(connected_from(&r.boards, &r.links, machine_id, root, width, height, depth))
    }

    async fn links_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<Link>> {
        let r = self.inner.read().await;
        let set: HashSet<BoardId> = board_ids.iter().copied().collect();
        Ok(r.links
            .iter()
            .filter(|l| set.contains(&l.from) || set.contains(&l.to))
            .cloned()
            .collect())
    }

    async fn bmp_ids_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<BmpId>> {
        let r = self.inner.read().await;
        let mut ids: Vec<BmpId> = board_ids
            .iter()
            .filter_map(|id| r.boards.get(id).map(|b| b.bmp_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    // ── Allocation commit ──

    async fn commit_allocation(
        &self,
        job_id: JobId,
        board_ids: &[BoardId],
        rect: Rectangle,
        root_board: BoardId,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        for &bid in board_ids {
            let board = w
                .boards
                .get_mut(&bid)
                .ok_or_else(|| anyhow!("board not found: {bid}"))?;
            if board.allocated_job.is_some() {
                return Err(anyhow!("board {bid} already allocated"));
            }
            board.allocated_job = Some(job_id);
        }
        let job = w
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job not found: {job_id}"))?;
        job.width = Some(rect.width);
        job.height = Some(rect.height);
        job.depth = Some(rect.depth);
        job.root_board = Some(root_board);
        w.tasks.remove(&job_id);
        Ok(())
    }

    async fn allocated_boards(&self, job_id: JobId) -> Result<Vec<BoardId>> {
        let r = self.inner.read().await;
        Ok(r.boards
            .values()
            .filter(|b| b.allocated_job == Some(job_id))
            .map(|b| b.id)
            .collect())
    }

    async fn release_boards(&self, job_id: JobId) -> Result<()> {
        let mut w = self.inner.write().await;
        for board in w.boards.values_mut() {
            if board.allocated_job == Some(job_id) {
                board.allocated_job = None;
            }
        }
        Ok(())
    }

    // ── Pending changes ──

    async fn insert_pending_changes(&self, changes: &[PendingChange]) -> Result<()> {
        self.inner.write().await.pending.extend_from_slice(changes);
        Ok(())
    }

    async fn count_pending(
        &self,
        job_id: JobId,
        source: JobState,
        target: JobState,
    ) -> Result<(i64, i64)> {
        let r = self.inner.read().await;
        let matching: Vec<&PendingChange> = r
            .pending
            .iter()
            .filter(|p| p.job_id == job_id && p.source_state == source && p.target_state == target)
            .collect();
        let n = matching.len() as i64;
        let errs = matching.iter().filter(|p| p.errored).count() as i64;
        Ok((n, errs))
    }

    async fn delete_pending(&self, job_id: JobId, source: JobState, target: JobState) -> Result<()> {
        let mut w = self.inner.write().await;
        w.pending
            .retain(|p| !(p.job_id == job_id && p.source_state == source && p.target_state == target));
        Ok(())
    }

    async fn pending_count_for_job(&self, job_id: JobId) -> Result<i64> {
        let r = self.inner.read().await;
        Ok(r.pending.iter().filter(|p| p.job_id == job_id).count() as i64)
    }

    // ── Tombstoning ──

    async fn read_tombstone_candidates(
        &self,
        grace_period_secs: i64,
        now: Timestamp,
    ) -> Result<(Vec<HistoricalJob>, Vec<HistoricalAlloc>)> {
        let r = self.inner.read().await;
        let cutoff = now - grace_period_secs * 1000;
        let dead_jobs: Vec<&Job> = r
            .jobs
            .values()
            .filter(|j| {
                j.state.is_destroyed() && j.death_timestamp.map(|t| t < cutoff).unwrap_or(false)
            })
            .collect();

        let jobs: Vec<HistoricalJob> = dead_jobs
            .iter()
            .map(|j| HistoricalJob {
                id: j.id,
                machine_id: j.machine_id,
                owner: j.owner.clone(),
                group: j.group.clone(),
                created_at: j.created_at,
                death_reason: j.death_reason.clone(),
                death_timestamp: j.death_timestamp,
                original_request: j.original_request.clone(),
            })
            .collect();

        let mut allocs = Vec::new();
        for j in &dead_jobs {
            if let (Some(w_), Some(h_), Some(d_)) = (j.width, j.height, j.depth) {
                for board in r.boards.values().filter(|b| b.allocated_job == Some(j.id)) {
                    allocs.push(HistoricalAlloc {
                        job_id: j.id,
                        board_id: board.id,
                        width: w_,
                        height: h_,
                        depth: d_,
                    });
                }
            }
        }

        Ok((jobs, allocs))
    }

    async fn delete_tombstoned(&self, job_ids: &[JobId]) -> Result<()> {
        let mut w = self.inner.write().await;
        let set: HashSet<JobId> = job_ids.iter().copied().collect();
        w.jobs.retain(|id, _| !set.contains(id));
        for board in w.boards.values_mut() {
            if let Some(jid) = board.allocated_job {
                if set.contains(&jid) {
                    board.allocated_job = None;
                }
            }
        }
        Ok(())
    }
}

/// In-memory historical store, for tests.
pub struct MemoryHistoricalStore {
    inner: tokio::sync::RwLock<(HashMap<JobId, HistoricalJob>, Vec<HistoricalAlloc>)>,
}

impl Default for MemoryHistoricalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHistoricalStore {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::RwLock::new((HashMap::new(), Vec::new())),
        }
    }

    pub async fn job_count(&self) -> usize {
        self.inner.read().await.0.len()
    }

    pub async fn alloc_count(&self) -> usize {
        self.inner.read().await.1.len()
    }
}

#[async_trait]
impl HistoricalStore for MemoryHistoricalStore {
    async fn insert_jobs(&self, jobs: &[HistoricalJob]) -> Result<()> {
        let mut w = self.inner.write().await;
        for job in jobs {
            w.0.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn insert_allocs(&self, allocs: &[HistoricalAlloc]) -> Result<()> {
        let mut w = self.inner.write().await;
        // Upsert semantics: drop any existing rows for the same (job, board)
        // pair before re-inserting, so a retried tombstone pass does not
        // duplicate allocation history.
        for alloc in allocs {
            w.1.retain(|a| !(a.job_id == alloc.job_id && a.board_id == alloc.board_id));
            w.1.push(alloc.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn board(id: BoardId, machine_id: MachineId, x: i32, y: i32, z: u8, bmp_id: BmpId) -> Board {
        Board {
            id,
            machine_id,
            coords: TriadCoords::new(x, y, z),
            ipv4: Ipv4Addr::new(10, 0, 0, id as u8),
            bmp_id,
            functioning: true,
            allocated_job: None,
        }
    }

    #[tokio::test]
    async fn find_free_board_picks_lowest_coords() {
        let store = MemoryStore::new();
        store
            .add_machine(Machine {
                id: 1,
                name: "m1".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        store.add_board(board(1, 1, 0, 0, 1, 100)).await;
        store.add_board(board(2, 1, 0, 0, 2, 100)).await;

        let found = store.find_free_board(1).await.unwrap();
        assert_eq!(found, Some(TriadCoords::new(0, 0, 0)));
    }

    #[tokio::test]
    async fn connected_board_ids_respects_enabled_links() {
        let store = MemoryStore::new();
        store
            .add_machine(Machine {
                id: 1,
                name: "m1".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        for z in 0..3u8 {
            store.add_board(board(z as i64 + 1, 1, 0, 0, z, 100)).await;
        }
        store
            .add_link(Link {
                from: 1,
                to: 2,
                direction: Direction::N,
                enabled: true,
            })
            .await;
        store
            .add_link(Link {
                from: 2,
                to: 3,
                direction: Direction::N,
                enabled: false,
            })
            .await;

        let ids = store
            .connected_board_ids(1, TriadCoords::new(0, 0, 0), 1, 1, 3)
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn commit_allocation_rejects_double_booking() {
        let store = MemoryStore::new();
        store
            .add_machine(Machine {
                id: 1,
                name: "m1".into(),
                max_width: 1,
                max_height: 1,
            })
            .await;
        store.add_board(board(1, 1, 0, 0, 0, 100)).await;
        store
            .save_job(&Job {
                id: 10,
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
                importance: 0,
            })
            .await
            .unwrap();

        store
            .commit_allocation(10, &[1], Rectangle::single_board(), 1)
            .await
            .unwrap();

        let err = store
            .commit_allocation(11, &[1], Rectangle::single_board(), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already allocated"));
    }
}
