//! External collaborator contracts (spec.md §6.1).
//!
//! These are the boundaries of the core: the BMP controller that physically
//! drives boards, the quota manager, and the session manager. The core
//! depends only on these traits, never on a concrete implementation — the
//! same pattern `bpmn-lite-core::store::ProcessStore` uses to keep the engine
//! decoupled from its persistence backend.

use async_trait::async_trait;

use crate::types::{BmpId, JobId};

/// The external controller that powers boards and (dis)enables links.
///
/// Only the Lifecycle Controller enqueues `PendingChange` rows and only the
/// BMP controller deletes them; `trigger_search` is a non-blocking
/// notification that rows exist for the given BMPs, not a command to act on
/// any particular board.
#[async_trait]
pub trait BmpController: Send + Sync {
    /// Notify the controller that `pending_changes` rows exist for these BMPs.
    async fn trigger_search(&self, bmp_ids: &[BmpId]);

    /// Stop driving boards immediately, unconditionally.
    async fn emergency_stop(&self);
}

/// Quota accounting — the core treats this as a black box predicate plus a
/// completion hook; the arithmetic itself is out of scope (spec.md §1).
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Whether `job_id` has exceeded its owning group's quota and should be
    /// destroyed.
    async fn should_kill_job(&self, job_id: JobId) -> bool;

    /// Notify quota accounting that a job has finished (successfully or by
    /// destruction), releasing any reservation it held.
    async fn finish_job(&self, job_id: JobId);
}

/// Session/proxy management (spec.md calls this the
/// ProxyRememberer/JobObjectRememberer in the source system).
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Close any session objects the job previously held.
    async fn close_job(&self, job_id: JobId);
}

/// No-op collaborators, useful for unit tests that exercise the Allocator or
/// Lifecycle Controller in isolation.
pub mod noop {
    use super::*;

    pub struct NoopBmp;

    #[async_trait]
    impl BmpController for NoopBmp {
        async fn trigger_search(&self, _bmp_ids: &[BmpId]) {}
        async fn emergency_stop(&self) {}
    }

    pub struct NoopQuota;

    #[async_trait]
    impl QuotaManager for NoopQuota {
        async fn should_kill_job(&self, _job_id: JobId) -> bool {
            false
        }
        async fn finish_job(&self, _job_id: JobId) {}
    }

    pub struct NoopSessions;

    #[async_trait]
    impl SessionManager for NoopSessions {
        async fn close_job(&self, _job_id: JobId) {}
    }
}
