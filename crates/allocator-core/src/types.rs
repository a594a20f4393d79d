use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

// ─── Scalar aliases ───────────────────────────────────────────

/// Opaque machine identity.
pub type MachineId = i64;

/// Opaque board identity.
pub type BoardId = i64;

/// Opaque job identity.
pub type JobId = i64;

/// BMP (Board Management Processor) identity a board is controlled through.
pub type BmpId = i64;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Current wall-clock time, in epoch milliseconds.
pub fn now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ─── Direction / links ─────────────────────────────────────────

/// The six inter-board link directions within a triad lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    N,
    E,
    SE,
    S,
    W,
    NW,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::N,
        Direction::E,
        Direction::SE,
        Direction::S,
        Direction::W,
        Direction::NW,
    ];
}

/// A directed adjacency between two boards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub from: BoardId,
    pub to: BoardId,
    pub direction: Direction,
    pub enabled: bool,
}

/// Per-direction "enable this link" booleans, as carried on a `PendingChange` row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionEnables {
    pub n: bool,
    pub e: bool,
    pub se: bool,
    pub s: bool,
    pub w: bool,
    pub nw: bool,
}

impl DirectionEnables {
    pub fn all_enabled() -> Self {
        Self {
            n: true,
            e: true,
            se: true,
            s: true,
            w: true,
            nw: true,
        }
    }

    pub fn all_disabled() -> Self {
        Self::default()
    }

    pub fn get(&self, dir: Direction) -> bool {
        match dir {
            Direction::N => self.n,
            Direction::E => self.e,
            Direction::SE => self.se,
            Direction::S => self.s,
            Direction::W => self.w,
            Direction::NW => self.nw,
        }
    }

    pub fn set(&mut self, dir: Direction, value: bool) {
        match dir {
            Direction::N => self.n = value,
            Direction::E => self.e = value,
            Direction::SE => self.se = value,
            Direction::S => self.s = value,
            Direction::W => self.w = value,
            Direction::NW => self.nw = value,
        }
    }
}

// ─── Coordinates / rectangles ──────────────────────────────────

/// Position of a board within a machine's triad lattice. `z` selects within a triad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriadCoords {
    pub x: i32,
    pub y: i32,
    pub z: u8,
}

impl TriadCoords {
    pub fn new(x: i32, y: i32, z: u8) -> Self {
        debug_assert!(z <= 2, "triad z must be in 0..=2");
        Self { x, y, z }
    }
}

/// An axis-aligned region of triads, `depth` in `{1, 3}`.
///
/// `depth == 1` is a single-board allocation; `depth == 3` is a full-triad
/// allocation (every board at every `z` within the `(width, height)` footprint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rectangle {
    pub width: i32,
    pub height: i32,
    pub depth: i32,
}

impl Rectangle {
    pub fn single_board() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
        }
    }

    pub fn triads(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            depth: 3,
        }
    }

    /// Total board capacity of the rectangle.
    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64 * self.depth as i64
    }
}

// ─── Machine / board ────────────────────────────────────────────

/// A physical machine: a rectangular extent of triads. Static after
/// provisioning; never mutated by the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub max_width: i32,
    pub max_height: i32,
}

/// A single SpiNNaker-class circuit board, the unit of allocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub machine_id: MachineId,
    pub coords: TriadCoords,
    pub ipv4: Ipv4Addr,
    pub bmp_id: BmpId,
    pub functioning: bool,
    pub allocated_job: Option<JobId>,
}

// ─── Job ────────────────────────────────────────────────────────

/// A job's position in the lifecycle state machine (spec.md §4.3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Power,
    Ready,
    Destroyed,
}

impl JobState {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, JobState::Destroyed)
    }
}

/// A queued or running allocation request.
///
/// Invariants (spec.md §3): a job in `Ready` has non-null geometry and at
/// least one allocated board; only a job in `Destroyed` may lose its
/// allocation; a `Queued` job has exactly one pending `AllocationTask`, a
/// non-`Queued` job has none.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub machine_id: MachineId,
    pub owner: String,
    pub group: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub depth: Option<i32>,
    pub root_board: Option<BoardId>,
    pub state: JobState,
    pub created_at: Timestamp,
    pub last_keepalive: Timestamp,
    pub keepalive_interval_secs: i64,
    pub keepalive_host: Option<String>,
    pub death_reason: Option<String>,
    pub death_timestamp: Option<Timestamp>,
    /// Opaque original request payload, never interpreted by the core.
    pub original_request: Vec<u8>,
    /// Escape-starvation weight, bumped once per unserved allocation pass.
    pub importance: i64,
}

impl Job {
    pub fn rectangle(&self) -> Option<Rectangle> {
        Some(Rectangle {
            width: self.width?,
            height: self.height?,
            depth: self.depth?,
        })
    }
}

// ─── AllocationTask ─────────────────────────────────────────────

/// A queued job's desired shape. Exactly one of `{num_boards}`,
/// `{width, height}`, `{width, height, root_board}`, `{root_board}` should be
/// set; classification is performed by the Allocator Engine (spec.md §4.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationTask {
    pub job_id: JobId,
    pub machine_id: MachineId,
    pub num_boards: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub root_board: Option<BoardId>,
    pub max_dead_boards: i32,
    pub importance: i64,
}

// ─── PendingChange ──────────────────────────────────────────────

/// One row per board per in-flight power transition (spec.md §3).
/// `count(pending_changes where job = J) == 0` is the signal that `J`'s
/// power transition is complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingChange {
    pub job_id: JobId,
    pub board_id: BoardId,
    pub power_on: bool,
    pub enables: DirectionEnables,
    pub source_state: JobState,
    pub target_state: JobState,
    pub in_progress: bool,
    /// Set by the BMP controller before it deletes the row, on failure.
    pub errored: bool,
}

// ─── Tombstoning ────────────────────────────────────────────────

/// A historical job row, as copied to the archival store by the Tombstoner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricalJob {
    pub id: JobId,
    pub machine_id: MachineId,
    pub owner: String,
    pub group: String,
    pub created_at: Timestamp,
    pub death_reason: Option<String>,
    pub death_timestamp: Option<Timestamp>,
    pub original_request: Vec<u8>,
}

/// A historical allocation row — one per board a tombstoned job once held.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricalAlloc {
    pub job_id: JobId,
    pub board_id: BoardId,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
}

// ─── Incident-free error descriptor (for quota/expiry) ─────────

/// Reasons used by the sweeper and emergency stop for `destroy_job`.
pub mod death_reasons {
    pub const KEEPALIVE_EXPIRED: &str = "keepalive expired";
    pub const QUOTA_EXCEEDED: &str = "quota exceeded";
    pub const EMERGENCY_STOP: &str = "emergency stop";
}
