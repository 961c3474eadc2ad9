//! Per-server task fan-out.
//!
//! A sweep flips its servers synchronously and then hands the slow remote
//! work for each one to a [`Fanout`]. The sweep returns without waiting; the
//! intermediate state keeps the next sweep from picking the same server up.
//! Sweeps that do not flip a state first rely on the fan-out refusing a
//! second task for a server it is still working on.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use fleetscale_core::ServerName;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{EngineError, Result};

/// Tracks the in-flight tasks of one reconciler.
///
/// Each task runs behind a panic boundary, so a bug hit while handling one
/// server is logged and the rest of the fleet carries on.
#[derive(Clone)]
pub struct Fanout {
    name: &'static str,
    tracker: TaskTracker,
    limit: Option<Arc<Semaphore>>,
    active: Arc<Mutex<HashSet<ServerName>>>,
}

/// Marks a server busy for as long as its task lives.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<ServerName>>>,
    server: ServerName,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.server);
    }
}

impl Fanout {
    /// Create a fan-out running at most `limit` tasks at once (0 = unbounded).
    #[must_use]
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            limit: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a task for `server` is still running or queued.
    #[must_use]
    pub fn is_active(&self, server: &ServerName) -> bool {
        self.active.lock().contains(server)
    }

    /// Run `work` for `server` in the background.
    ///
    /// Ignored if a task for the same server is still running or queued.
    pub fn spawn<F>(&self, server: ServerName, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.active.lock().insert(server.clone()) {
            tracing::debug!(reconciler = self.name, server = %server, "Task already in flight");
            return;
        }

        let name = self.name;
        let limit = self.limit.clone();
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            server: server.clone(),
        };

        self.tracker.spawn(async move {
            let _guard = guard;

            let _permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
                tracing::error!(
                    reconciler = name,
                    server = %server,
                    panic = %panic_message(panic.as_ref()),
                    "Task panicked"
                );
            }
        });
    }

    /// Wait for every task spawned so far to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of tasks still running or waiting for a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("name", &self.name)
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `work` until it finishes, `duration` elapses, or `cancel` fires.
///
/// # Errors
///
/// Returns `EngineError::Interrupted` on cancellation,
/// `EngineError::Timeout` when the deadline passes, or whatever `work`
/// itself returns.
pub async fn bounded<T, F>(cancel: &CancellationToken, duration: Duration, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Interrupted),
        result = timed(duration, work) => result,
    }
}

/// Run `work` until it finishes or `duration` elapses, ignoring shutdown.
///
/// For calls whose result must be recorded once they have been issued.
///
/// # Errors
///
/// Returns `EngineError::Timeout` when the deadline passes, or whatever
/// `work` itself returns.
pub async fn timed<T, F>(duration: Duration, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, work).await {
        Ok(inner) => inner,
        Err(_) => Err(EngineError::Timeout(duration)),
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns `EngineError::Interrupted` on cancellation.
pub async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Interrupted),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn name(n: usize) -> ServerName {
        ServerName::parse(&format!("agent-{n}")).unwrap()
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let fanout = Fanout::new("test", 0);
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let done = Arc::clone(&done);
            fanout.spawn(name(i), async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        fanout.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(fanout.in_flight(), 0);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let fanout = Fanout::new("test", 0);
        let done = Arc::new(AtomicUsize::new(0));

        fanout.spawn(name(1), async { panic!("boom") });
        let counter = Arc::clone(&done);
        fanout.spawn(name(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fanout.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);

        // Still usable after a panic and a drain
        let counter = Arc::clone(&done);
        fanout.spawn(name(3), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        fanout.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn limit_bounds_concurrency() {
        let fanout = Fanout::new("test", 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            fanout.spawn(name(i), async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        fanout.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn duplicate_server_task_is_ignored() {
        let fanout = Fanout::new("test", 0);
        let runs = Arc::new(AtomicUsize::new(0));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let counter = Arc::clone(&runs);
        fanout.spawn(name(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = gate.await;
        });
        assert!(fanout.is_active(&name(1)));

        let counter = Arc::clone(&runs);
        fanout.spawn(name(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        release.send(()).unwrap();
        fanout.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!fanout.is_active(&name(1)));

        // Free again once the first task is done, even after a panic.
        fanout.spawn(name(1), async { panic!("boom") });
        fanout.drain().await;
        assert!(!fanout.is_active(&name(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_passes_result_or_times_out() {
        let result: Result<u32> = timed(Duration::from_secs(5), async { Ok(3) }).await;
        assert_eq!(result.unwrap(), 3);

        let result: Result<()> = timed(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<()> = bounded(&cancel, Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn bounded_is_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32> = bounded(&cancel, Duration::from_secs(5), async { Ok(1) }).await;
        assert!(matches!(result, Err(EngineError::Interrupted)));
    }

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let ok: Result<u32> = bounded(&cancel, Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32> = bounded(&cancel, Duration::from_secs(5), async {
            Err(EngineError::Queue("x".into()))
        })
        .await;
        assert!(matches!(err, Err(EngineError::Queue(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_sleeps_or_interrupts() {
        let cancel = CancellationToken::new();
        pause(&cancel, Duration::from_secs(1)).await.unwrap();
        cancel.cancel();
        assert!(pause(&cancel, Duration::from_secs(1)).await.is_err());
    }
}
