use std::future::Future;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::observability;

/// Owns every dispatched unit of work, retries included, so shutdown can wait for it.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
}

struct InFlightGuard;

impl InFlightGuard {
    fn enter() -> Self {
        observability::increment_in_flight();
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        observability::decrement_in_flight();
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = InFlightGuard::enter();
        self.tracker.spawn(async move {
            let _guard = guard;
            work.await;
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `grace` for outstanding units; returns how many were still running
    /// when it ran out.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.tracker.close();
        let outstanding = self.tracker.len();
        if outstanding > 0 {
            let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
            info!(outstanding, grace_ms, "draining in-flight work");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = self.tracker.len();
                warn!(abandoned, "shutdown grace elapsed with work still running");
                abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_work_inside_the_grace_period() {
        let supervisor = TaskSupervisor::new();
        let finished = Arc::new(AtomicUsize::new(0));
        for delay in [1, 10] {
            let finished = finished.clone();
            supervisor.spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(supervisor.in_flight(), 2);

        let abandoned = supervisor.drain(Duration::from_secs(30)).await;
        assert_eq!(abandoned, 0);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_reports_work_still_running_after_grace() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        supervisor.spawn(async {});

        let abandoned = supervisor.drain(Duration::from_secs(5)).await;
        assert_eq!(abandoned, 1);
    }
}
