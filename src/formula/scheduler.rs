//! Fixed-delay background drains on a small tokio worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::Notify;

use crate::error::FormulaError;

/// Runs a drain step repeatedly, waiting `interval` after each run completes.
///
/// A drain never overlaps the next one. Stopping does not wait for a drain
/// that is already running.
pub(crate) struct DrainScheduler {
    runtime: Option<Runtime>,
    shutdown: Arc<Notify>,
}

impl DrainScheduler {
    pub(crate) fn start<F>(interval: Duration, workers: usize, drain: F) -> Result<Self, FormulaError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("path-flow-drain")
            .enable_time()
            .build()?;

        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let drain = Arc::new(drain);
        runtime.spawn(async move {
            tracing::debug!(?interval, "drain loop started");
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let drain = drain.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || drain()).await {
                    tracing::error!(error = %err, "formula drain panicked");
                }
            }
            tracing::debug!("drain loop stopped");
        });

        Ok(Self {
            runtime: Some(runtime),
            shutdown,
        })
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for DrainScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut scheduler = DrainScheduler::start(Duration::from_millis(5), 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
        assert!(runs.load(Ordering::SeqCst) >= 3);

        // Let a run that was already in flight finish, then check that no
        // further runs start.
        std::thread::sleep(Duration::from_millis(50));
        let after = runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_drains_do_not_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (a, o, r) = (active.clone(), overlaps.clone(), runs.clone());
        let scheduler = DrainScheduler::start(Duration::from_millis(1), 3, move || {
            if a.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(10));
            a.fetch_sub(1, Ordering::SeqCst);
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(scheduler);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
