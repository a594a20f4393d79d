//! Scheduler (spec.md §4.6): periodic, cron-style, and one-shot triggers for
//! the allocate / expire / tombstone tasks, refusing new work once emergency
//! stop is active.
//!
//! Ground pattern: the retry loop in the teacher's pending-dispatch worker —
//! `loop { ...; select! { sleep => {}, shutdown => break } }` — generalized
//! to a shared atomic flag instead of a `watch` shutdown channel, since many
//! independent periodic tasks share one flag here.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{AllocatorError, Result};

/// A boxed recurring task, re-invoked on every tick.
pub type AsyncTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Periodic/cron/one-shot scheduling, gated on a shared emergency-stop flag.
pub struct Scheduler {
    emergency: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(emergency: Arc<AtomicBool>) -> Self {
        Self {
            emergency,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` every `period`, starting immediately. Stops silently once
    /// the emergency-stop flag is set.
    pub fn schedule_at_fixed_rate(&self, label: &'static str, period: Duration, task: AsyncTask) {
        let emergency = self.emergency.clone();
        let handle = tokio::spawn(async move {
            loop {
                if emergency.load(Ordering::SeqCst) {
                    tracing::info!(label, "emergency stop active, periodic task exiting");
                    break;
                }
                task().await;
                tokio::time::sleep(period).await;
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Run `task` on a cron schedule (6-field: sec min hour day month dow).
    pub fn schedule_cron(&self, label: &'static str, expr: &str, task: AsyncTask) -> Result<()> {
        let schedule = cron::Schedule::from_str(expr).map_err(|e| {
            AllocatorError::StoreError(anyhow::anyhow!("invalid cron expression `{expr}`: {e}"))
        })?;
        let emergency = self.emergency.clone();
        let label = label.to_string();

        let handle = tokio::spawn(async move {
            loop {
                if emergency.load(Ordering::SeqCst) {
                    tracing::info!(label = %label, "emergency stop active, cron task exiting");
                    break;
                }
                let now = chrono::Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    tracing::warn!(label = %label, "cron schedule has no further occurrences");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;
                if emergency.load(Ordering::SeqCst) {
                    break;
                }
                task().await;
            }
        });
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }

    /// Schedule a one-shot task after `delay`. Refused with
    /// `AllocatorError::Unschedulable` once emergency stop is active —
    /// used for `updateJob`'s re-queue path and `scheduleAllocateNow`.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.emergency.load(Ordering::SeqCst) {
            return Err(AllocatorError::Unschedulable);
        }
        let handle = tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            task().await;
        });
        self.handles.lock().unwrap().push(handle);
        Ok(())
    }

    /// Abort every registered periodic/cron future (spec.md §4.7 step 2).
    pub fn cancel_all(&self) {
        for h in self.handles.lock().unwrap().drain(..) {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_task_runs_and_stops_on_emergency() {
        let emergency = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(emergency.clone());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.schedule_at_fixed_rate(
            "test",
            Duration::from_secs(1),
            Arc::new(move || {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        emergency.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        let after_stop = count.load(Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn schedule_once_is_refused_during_emergency_stop() {
        let emergency = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(emergency);
        let err = scheduler
            .schedule_once(Duration::from_secs(0), || async {})
            .unwrap_err();
        assert!(matches!(err, AllocatorError::Unschedulable));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_once_runs_after_delay() {
        let emergency = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler::new(emergency);
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();

        scheduler
            .schedule_once(Duration::from_millis(50), move || async move {
                r.store(true, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let scheduler = Scheduler::new(Arc::new(AtomicBool::new(false)));
        let err = scheduler
            .schedule_cron("bad", "not a cron expr", Arc::new(|| Box::pin(async {})))
            .unwrap_err();
        assert!(matches!(err, AllocatorError::StoreError(_)));
    }
}
