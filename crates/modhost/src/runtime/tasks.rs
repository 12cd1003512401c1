//! Background work owned by modules
//!
//! [`TaskSet`] is a shared tracking set that modules may spawn into so the
//! runtime can report leftovers after unload and abort them at shutdown.
//! [`PeriodicTask`] is a job that re-runs on a fixed delay, owned by the
//! module that starts it and stopped from its unload hook.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use dashmap::DashMap;
use futures::FutureExt;
use modhost_sdk::BoxFuture;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

#[derive(Default)]
struct TaskSetInner {
    next_id: AtomicU64,
    tasks: DashMap<u64, (String, AbortHandle)>,
}

/// Shared set of tracked tasks, cheap to clone
#[derive(Clone, Default)]
pub struct TaskSet {
    inner: Arc<TaskSetInner>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. It leaves the set when it completes.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            fut.await;
            inner.tasks.remove(&id);
        });
        let abort = handle.abort_handle();
        self.inner.tasks.insert(id, (name.into(), abort.clone()));
        abort
    }

    fn prune(&self) {
        self.inner.tasks.retain(|_, (_, abort)| !abort.is_finished());
    }

    /// Number of tracked tasks still running.
    pub fn len(&self) -> usize {
        self.prune();
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the tracked tasks still running.
    pub fn names(&self) -> Vec<String> {
        self.prune();
        let mut names: Vec<String> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect();
        names.sort();
        names
    }

    /// Abort every tracked task.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        self.inner.tasks.retain(|_, (name, abort)| {
            if !abort.is_finished() {
                tracing::debug!(task = %name, "Aborting tracked task");
                abort.abort();
                aborted += 1;
            }
            false
        });
        aborted
    }
}

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Running {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// A job re-run with a fixed delay between iterations.
///
/// # Example
/// ```ignore
/// let heartbeat = PeriodicTask::new("heartbeat", Duration::from_secs(60));
/// heartbeat.start(|| async { tracing::info!("alive"); Ok(()) })?;
/// // in on_unload
/// heartbeat.stop_wait().await;
/// ```
pub struct PeriodicTask {
    name: String,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the loop. The first iteration runs immediately.
    ///
    /// An iteration that fails or panics ends the loop.
    pub fn start<F, Fut>(&self, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            bail!("periodic task {} is already running", self.name);
        }

        let job: JobFn = Arc::new(move || Box::pin(job()));
        let (stop, mut stop_rx) = watch::channel(false);
        let name = self.name.clone();
        let period = self.period;

        let handle = tokio::spawn(async move {
            loop {
                match std::panic::AssertUnwindSafe(job()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(task = %name, "Periodic task failed: {:#}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::error!(task = %name, "Periodic task panicked");
                        break;
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(task = %name, "Periodic task stopped");
        });

        *running = Some(Running { handle, stop });
        Ok(())
    }

    /// Ask the loop to stop. A running iteration is allowed to finish.
    pub fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = running.as_ref() {
            r.stop.send_replace(true);
        }
    }

    /// Abort the loop immediately, even mid-iteration.
    pub fn cancel(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = running.take() {
            r.handle.abort();
        }
    }

    /// Stop and wait for the current iteration to finish.
    pub async fn stop_wait(&self) {
        let running = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.take()
        };
        if let Some(r) = running {
            r.stop.send_replace(true);
            let _ = r.handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let running = self.running.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = running.take() {
            r.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_task_set_tracks_until_completion() {
        let tasks = TaskSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn("waiter", async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.names(), vec!["waiter"]);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_task_set_abort_all() {
        let tasks = TaskSet::new();
        tasks.spawn("forever", std::future::pending());
        tasks.spawn("forever-too", std::future::pending());
        assert_eq!(tasks.abort_all(), 2);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_task_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("tick", Duration::from_millis(5));
        let c = Arc::clone(&counter);
        task.start(move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop_wait().await;
        assert!(!task.is_running());

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several iterations, got {}", seen);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_periodic_task_rejects_double_start() {
        let task = PeriodicTask::new("tick", Duration::from_secs(60));
        task.start(|| async { Ok(()) }).unwrap();
        assert!(task.start(|| async { Ok(()) }).is_err());
        task.cancel();
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_periodic_task_stops_on_failure() {
        let task = PeriodicTask::new("fails", Duration::from_millis(1));
        task.start(|| async { anyhow::bail!("nope") }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_running());
    }
}
