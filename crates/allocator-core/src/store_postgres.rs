//! Postgres-backed `Store`/`HistoricalStore`, grounded on
//! `bpmn-lite-core::store_postgres::PostgresProcessStore` — a thin
//! `sqlx::PgPool` wrapper, JSON columns for the small nested structs, and
//! `EXTRACT(EPOCH FROM ...) * 1000` round-tripping for millisecond
//! timestamps against `TIMESTAMPTZ` columns.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::store::{HistoricalStore, Store};
use crate::types::*;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the bundled migrations. Call once at startup.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn direction_from_str(s: &str) -> Result<Direction> {
    Ok(match s {
        "N" => Direction::N,
        "E" => Direction::E,
        "SE" => Direction::SE,
        "S" => Direction::S,
        "W" => Direction::W,
        "NW" => Direction::NW,
        other => return Err(anyhow!("unknown direction: {other}")),
    })
}

fn state_str(s: JobState) -> &'static str {
    match s {
        JobState::Queued => "QUEUED",
        JobState::Power => "POWER",
        JobState::Ready => "READY",
        JobState::Destroyed => "DESTROYED",
    }
}

fn state_from_str(s: &str) -> Result<JobState> {
    Ok(match s {
        "QUEUED" => JobState::Queued,
        "POWER" => JobState::Power,
        "READY" => JobState::Ready,
        "DESTROYED" => JobState::Destroyed,
        other => return Err(anyhow!("unknown job state: {other}")),
    })
}

/// Epoch-ms `Timestamp` to a `chrono::DateTime<Utc>` for binding against
/// `TIMESTAMPTZ` columns.
fn ms_to_datetime(ms: Timestamp) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
    let state: String = row.get("state");
    let created_at_ms: f64 = row.get("created_at_ms");
    let last_keepalive_ms: f64 = row.get("last_keepalive_ms");
    let death_timestamp_ms: Option<f64> = row.get("death_timestamp_ms");
    Ok(Job {
        id: row.get("id"),
        machine_id: row.get("machine_id"),
        owner: row.get("owner"),
        group: row.get("job_group"),
        width: row.get("width"),
        height: row.get("height"),
        depth: row.get("depth"),
        root_board: row.get("root_board"),
        state: state_from_str(&state)?,
        created_at: created_at_ms as i64,
        last_keepalive: last_keepalive_ms as i64,
        keepalive_interval_secs: row.get("keepalive_interval_secs"),
        keepalive_host: row.get("keepalive_host"),
        death_reason: row.get("death_reason"),
        death_timestamp: death_timestamp_ms.map(|v| v as i64),
        original_request: row.get("original_request"),
        importance: row.get("importance"),
    })
}

const JOB_COLUMNS: &str = r#"
    id, machine_id, owner, job_group, width, height, depth, root_board, state,
    EXTRACT(EPOCH FROM created_at) * 1000 AS created_at_ms,
    EXTRACT(EPOCH FROM last_keepalive) * 1000 AS last_keepalive_ms,
    keepalive_interval_secs, keepalive_host, death_reason,
    EXTRACT(EPOCH FROM death_timestamp) * 1000 AS death_timestamp_ms,
    original_request, importance
"#;

#[async_trait]
impl Store for PostgresStore {
    // ── Machines ──

    async fn load_machine(&self, id: MachineId) -> Result<Option<Machine>> {
        let row = sqlx::query("SELECT id, name, max_width, max_height FROM machines WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Machine {
            id: r.get("id"),
            name: r.get("name"),
            max_width: r.get("max_width"),
            max_height: r.get("max_height"),
        }))
    }

    async fn board_coords(&self, board_id: BoardId) -> Result<Option<TriadCoords>> {
        let row = sqlx::query("SELECT x, y, z FROM boards WHERE id = $1")
            .bind(board_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| TriadCoords::new(r.get("x"), r.get("y"), r.get::<i16, _>("z") as u8)))
    }

    // ── Jobs ──

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, machine_id, owner, job_group, width, height, depth, root_board, state,
                created_at, last_keepalive, keepalive_interval_secs, keepalive_host,
                death_reason, death_timestamp, original_request, importance
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                machine_id = EXCLUDED.machine_id,
                owner = EXCLUDED.owner,
                job_group = EXCLUDED.job_group,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                depth = EXCLUDED.depth,
                root_board = EXCLUDED.root_board,
                state = EXCLUDED.state,
                last_keepalive = EXCLUDED.last_keepalive,
                keepalive_interval_secs = EXCLUDED.keepalive_interval_secs,
                keepalive_host = EXCLUDED.keepalive_host,
                death_reason = EXCLUDED.death_reason,
                death_timestamp = EXCLUDED.death_timestamp,
                importance = EXCLUDED.importance
            "#,
        )
        .bind(job.id)
        .bind(job.machine_id)
        .bind(&job.owner)
        .bind(&job.group)
        .bind(job.width)
        .bind(job.height)
        .bind(job.depth)
        .bind(job.root_board)
        .bind(state_str(job.state))
        .bind(ms_to_datetime(job.created_at))
        .bind(ms_to_datetime(job.last_keepalive))
        .bind(job.keepalive_interval_secs)
        .bind(&job.keepalive_host)
        .bind(&job.death_reason)
        .bind(job.death_timestamp.map(ms_to_datetime))
        .bind(&job.original_request)
        .bind(job.importance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_state(&self, id: JobId, state: JobState) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET state = $1 WHERE id = $2")
            .bind(state_str(state))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job not found: {id}"));
        }
        Ok(())
    }

    async fn update_job_death(&self, id: JobId, reason: &str, at: Timestamp) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET death_reason = $1, death_timestamp = $2 WHERE id = $3")
            .bind(reason)
            .bind(ms_to_datetime(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job not found: {id}"));
        }
        Ok(())
    }

    async fn update_job_keepalive(&self, id: JobId, at: Timestamp) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET last_keepalive = $1 WHERE id = $2")
            .bind(ms_to_datetime(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("job not found: {id}"));
        }
        Ok(())
    }

    async fn expired_job_ids(&self, now: Timestamp) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state != 'DESTROYED'
              AND last_keepalive + (keepalive_interval_secs * interval '1 second') < $1
            "#,
        )
        .bind(ms_to_datetime(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn live_job_ids(&self, limit: usize) -> Result<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE state != 'DESTROYED' ORDER BY id LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn all_live_job_ids(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query("SELECT id FROM jobs WHERE state != 'DESTROYED' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ── Allocation tasks ──

    async fn queued_tasks(&self) -> Result<Vec<AllocationTask>> {
        let rows = sqlx::query(
            r#"
            SELECT t.job_id, t.machine_id, t.num_boards, t.width, t.height,
                   t.root_board, t.max_dead_boards, t.importance
            FROM allocation_tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE j.state = 'QUEUED'
            ORDER BY t.importance DESC, t.job_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| AllocationTask {
                job_id: r.get("job_id"),
                machine_id: r.get("machine_id"),
                num_boards: r.get("num_boards"),
                width: r.get("width"),
                height: r.get("height"),
                root_board: r.get("root_board"),
                max_dead_boards: r.get("max_dead_boards"),
                importance: r.get("importance"),
            })
            .collect())
    }

    async fn create_allocation_task(&self, task: &AllocationTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allocation_tasks
                (job_id, machine_id, num_boards, width, height, root_board, max_dead_boards, importance)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO UPDATE SET
                num_boards = EXCLUDED.num_boards,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                root_board = EXCLUDED.root_board,
                max_dead_boards = EXCLUDED.max_dead_boards,
                importance = EXCLUDED.importance
            "#,
        )
        .bind(task.job_id)
        .bind(task.machine_id)
        .bind(task.num_boards)
        .bind(task.width)
        .bind(task.height)
        .bind(task.root_board)
        .bind(task.max_dead_boards)
        .bind(task.importance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_allocation_task(&self, job_id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM allocation_tasks WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_importance_all_queued(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE allocation_tasks SET importance = importance + 1
            WHERE job_id IN (SELECT id FROM jobs WHERE state = 'QUEUED')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Spatial search ──

    async fn find_free_board(&self, machine_id: MachineId) -> Result<Option<TriadCoords>> {
        let row = sqlx::query(
            r#"
            SELECT x, y, z FROM boards
            WHERE machine_id = $1 AND functioning AND allocated_job IS NULL
            ORDER BY x, y, z
            LIMIT 1
            "#,
        )
        .bind(machine_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| TriadCoords::new(r.get("x"), r.get("y"), r.get::<i16, _>("z") as u8)))
    }

    async fn find_rectangle(
        &self,
        machine_id: MachineId,
        width: i32,
        height: i32,
        tolerance: i32,
    ) -> Result<Vec<TriadCoords>> {
        let Some(machine) = self.load_machine(machine_id).await? else {
            return Ok(Vec::new());
        };
        if width > machine.max_width || height > machine.max_height {
            return Ok(Vec::new());
        }
        let capacity = width as i64 * height as i64 * 3;

        let rows = sqlx::query(
            r#"
            SELECT x0, y0, free FROM (
                SELECT gx AS x0, gy AS y0,
                       (SELECT count(*) FROM boards b
                        WHERE b.machine_id = $1 AND b.functioning AND b.allocated_job IS NULL
                          AND b.x >= gx AND b.x < gx + $2 AND b.y >= gy AND b.y < gy + $3) AS free
                FROM generate_series(0, $4 - $2) AS gx,
                     generate_series(0, $5 - $3) AS gy
            ) candidates
            WHERE free >= $6
            ORDER BY free DESC, x0 ASC, y0 ASC
            "#,
        )
        .bind(machine_id)
        .bind(width)
        .bind(height)
        .bind(machine.max_width)
        .bind(machine.max_height)
        .bind(capacity - tolerance as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| TriadCoords::new(r.get("x0"), r.get("y0"), 0))
            .collect())
    }

    async fn find_rectangle_at(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        max_dead: i32,
    ) -> Result<Option<TriadCoords>> {
        let capacity = width as i64 * height as i64 * 3;
        let row = sqlx::query(
            r#"
            SELECT count(*) AS free FROM boards
            WHERE machine_id = $1 AND functioning AND allocated_job IS NULL
              AND x >= $2 AND x < $2 + $3 AND y >= $4 AND y < $4 + $5
            "#,
        )
        .bind(machine_id)
        .bind(root.x)
        .bind(width)
        .bind(root.y)
        .bind(height)
        .fetch_one(&self.pool)
        .await?;
        let free: i64 = row.get("free");
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
        let row = sqlx::query(
            r#"
            SELECT id FROM boards
            WHERE machine_id = $1 AND x = $2 AND y = $3 AND z = $4
              AND functioning AND allocated_job IS NULL
            "#,
        )
        .bind(machine_id)
        .bind(root.x)
        .bind(root.y)
        .bind(root.z as i16)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn count_connected(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
    ) -> Result<i32> {
        Ok(self
            .connected_board_ids(machine_id, root, width, height, 3)
            .await?
            .len() as i32)
    }

    async fn connected_board_ids(
        &self,
        machine_id: MachineId,
        root: TriadCoords,
        width: i32,
        height: i32,
        depth: i32,
    ) -> Result<Vec<BoardId>> {
        // Recursive CTE walking `links` from the root board, bounded to the
        // rectangle's footprint and (when depth == 1) a single z-plane.
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE reachable(id) AS (
                SELECT id FROM boards
                WHERE machine_id = $1 AND x = $2 AND y = $3 AND z = $4 AND functioning
                UNION
                SELECT b.id FROM boards b
                JOIN links l ON l.to_board = b.id
                JOIN reachable r ON r.id = l.from_board
                WHERE l.enabled AND b.functioning AND b.machine_id = $1
                  AND b.x >= $2 AND b.x < $2 + $5 AND b.y >= $3 AND b.y < $3 + $6
                  AND ($7 = 3 OR b.z = $4)
            )
            SELECT id FROM reachable ORDER BY id
            "#,
        )
        .bind(machine_id)
        .bind(root.x)
        .bind(root.y)
        .bind(root.z as i16)
        .bind(width)
        .bind(height)
        .bind(depth)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn links_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT from_board, to_board, direction, enabled FROM links WHERE from_board = ANY($1) OR to_board = ANY($1)",
        )
        .bind(board_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let dir: String = r.get("direction");
                Ok(Link {
                    from: r.get("from_board"),
                    to: r.get("to_board"),
                    direction: direction_from_str(&dir)?,
                    enabled: r.get("enabled"),
                })
            })
            .collect()
    }

    async fn bmp_ids_for_boards(&self, board_ids: &[BoardId]) -> Result<Vec<BmpId>> {
        let rows = sqlx::query("SELECT DISTINCT bmp_id FROM boards WHERE id = ANY($1) ORDER BY bmp_id")
            .bind(board_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("bmp_id")).collect())
    }

    // ── Allocation commit ──

    async fn commit_allocation(
        &self,
        job_id: JobId,
        board_ids: &[BoardId],
        rect: Rectangle,
        root_board: BoardId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE boards SET allocated_job = $1 WHERE id = ANY($2) AND allocated_job IS NULL",
        )
        .bind(job_id)
        .bind(board_ids)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() as usize != board_ids.len() {
            return Err(anyhow!("one or more boards already allocated"));
        }

        sqlx::query("UPDATE jobs SET width = $1, height = $2, depth = $3, root_board = $4 WHERE id = $5")
            .bind(rect.width)
            .bind(rect.height)
            .bind(rect.depth)
            .bind(root_board)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM allocation_tasks WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn allocated_boards(&self, job_id: JobId) -> Result<Vec<BoardId>> {
        let rows = sqlx::query("SELECT id FROM boards WHERE allocated_job = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn release_boards(&self, job_id: JobId) -> Result<()> {
        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Pending changes ──

    async fn insert_pending_changes(&self, changes: &[PendingChange]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            let enables = serde_json::to_value(&change.enables)?;
            sqlx::query(
                r#"
                INSERT INTO pending_changes
                    (job_id, board_id, power_on, enables, source_state, target_state, in_progress, errored)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(change.job_id)
            .bind(change.board_id)
            .bind(change.power_on)
            .bind(&enables)
            .bind(state_str(change.source_state))
            .bind(state_str(change.target_state))
            .bind(change.in_progress)
            .bind(change.errored)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_pending(&self, job_id: JobId, source: JobState, target: JobState) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS total, count(*) FILTER (WHERE errored) AS errors
            FROM pending_changes
            WHERE job_id = $1 AND source_state = $2 AND target_state = $3
            "#,
        )
        .bind(job_id)
        .bind(state_str(source))
        .bind(state_str(target))
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("total"), row.get("errors")))
    }

    async fn delete_pending(&self, job_id: JobId, source: JobState, target: JobState) -> Result<()> {
        sqlx::query("DELETE FROM pending_changes WHERE job_id = $1 AND source_state = $2 AND target_state = $3")
            .bind(job_id)
            .bind(state_str(source))
            .bind(state_str(target))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_count_for_job(&self, job_id: JobId) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS n FROM pending_changes WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ── Tombstoning ──

    async fn read_tombstone_candidates(
        &self,
        grace_period_secs: i64,
        now: Timestamp,
    ) -> Result<(Vec<HistoricalJob>, Vec<HistoricalAlloc>)> {
        let job_rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'DESTROYED' AND death_timestamp < $1 - ($2 * interval '1 second')",
        ))
        .bind(ms_to_datetime(now))
        .bind(grace_period_secs)
        .fetch_all(&self.pool)
        .await?;

        let jobs: Vec<HistoricalJob> = job_rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<Job>>>()?
            .into_iter()
            .map(|j| HistoricalJob {
                id: j.id,
                machine_id: j.machine_id,
                owner: j.owner,
                group: j.group,
                created_at: j.created_at,
                death_reason: j.death_reason,
                death_timestamp: j.death_timestamp,
                original_request: j.original_request,
            })
            .collect();

        if jobs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

        let alloc_rows = sqlx::query(
            r#"
            SELECT b.allocated_job AS job_id, b.id AS board_id, j.width, j.height, j.depth
            FROM boards b
            JOIN jobs j ON j.id = b.allocated_job
            WHERE b.allocated_job = ANY($1)
            "#,
        )
        .bind(&job_ids)
        .fetch_all(&self.pool)
        .await?;

        let allocs = alloc_rows
            .iter()
            .map(|r| HistoricalAlloc {
                job_id: r.get("job_id"),
                board_id: r.get("board_id"),
                width: r.get("width"),
                height: r.get("height"),
                depth: r.get("depth"),
            })
            .collect();

        Ok((jobs, allocs))
    }

    async fn delete_tombstoned(&self, job_ids: &[JobId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = ANY($1)")
            .bind(job_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM allocation_tasks WHERE job_id = ANY($1)")
            .bind(job_ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(job_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Historical archive store, backed by the same pool by convention but
/// pointed at a separate schema/database in production deployments.
pub struct PostgresHistoricalStore {
    pool: PgPool,
}

impl PostgresHistoricalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoricalStore for PostgresHistoricalStore {
    async fn insert_jobs(&self, jobs: &[HistoricalJob]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO historical_jobs
                    (id, machine_id, owner, job_group, created_at, death_reason, death_timestamp, original_request)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(job.id)
            .bind(job.machine_id)
            .bind(&job.owner)
            .bind(&job.group)
            .bind(ms_to_datetime(job.created_at))
            .bind(&job.death_reason)
            .bind(job.death_timestamp.map(ms_to_datetime))
            .bind(&job.original_request)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_allocs(&self, allocs: &[HistoricalAlloc]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for alloc in allocs {
            sqlx::query(
                r#"
                INSERT INTO historical_allocs (job_id, board_id, width, height, depth)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (job_id, board_id) DO NOTHING
                "#,
            )
            .bind(alloc.job_id)
            .bind(alloc.board_id)
            .bind(alloc.width)
            .bind(alloc.height)
            .bind(alloc.depth)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
