use thiserror::Error;

use crate::types::JobId;

/// The error taxonomy of spec.md §7.
///
/// `BadRequest` is permanent (the offending `AllocationTask` is discarded),
/// `StoreBusy` is transient (the caller logs and lets the next scheduler tick
/// retry), `StoreError` is unexpected and propagates, `PowerError` is
/// terminal for one power transition, `AlreadyDestroyed` is a silent no-op at
/// the call site, and `Unschedulable` is returned instead of raised during
/// emergency stop.
#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("bad allocation request for job {job_id}: {reason}")]
    BadRequest { job_id: JobId, reason: String },

    #[error("store busy: {0}")]
    StoreBusy(String),

    #[error("store error: {0}")]
    StoreError(#[from] anyhow::Error),

    #[error("power transition failed for job {job_id} ({source:?} -> {target:?})")]
    PowerError {
        job_id: JobId,
        source: crate::types::JobState,
        target: crate::types::JobState,
    },

    #[error("job {0} already destroyed")]
    AlreadyDestroyed(JobId),

    #[error("allocator unschedulable: emergency stop is active")]
    Unschedulable,
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// Outcome of `LifecycleController::update_job`, replacing the teacher's use
/// of exceptions for control flow (spec.md §9 re-architecting notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// All pending changes resolved without error; the job advanced to its
    /// target state (or was finalized as destroyed).
    Updated,
    /// Changes are still in flight; no action taken.
    Pending,
    /// All changes errored while the job was mid-allocation; schedule
    /// `setPower(OFF, QUEUED)` as a one-shot and return the job to the queue.
    RequeueNeeded,
    /// All changes errored while the job was live (`READY`); destroy it.
    DestroyNeeded { reason: &'static str },
}
