use std::fmt;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

/// Error returned by [`WorkerPool::submit`] once the pool has been shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolShutdown;

/// A fixed number of threads running synchronous units of work.
///
/// Submitted work runs on one of at most `threads` threads at a time. Submissions exceeding that
/// are queued and picked up in the order they were submitted.
///
/// The pool is backed by the blocking thread pool of a dedicated tokio runtime. The handles
/// returned by [`submit`](Self::submit) are regular [`JoinHandle`]s that can be awaited from any
/// runtime.
pub struct WorkerPool {
    threads: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// Starts a pool with `threads` threads (at least one), named after `thread_name`.
    ///
    /// Idle threads are torn down after `keep_alive`, and spawned again on demand.
    pub fn new(threads: usize, thread_name: &str, keep_alive: Duration) -> io::Result<Self> {
        let threads = threads.max(1);
        // A current-thread runtime is never driven, it only provides the blocking pool. Unlike
        // the multi-thread flavor, its worker does not count towards `max_blocking_threads`.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .thread_name(thread_name)
            .max_blocking_threads(threads)
            .thread_keep_alive(keep_alive)
            .build()?;

        tracing::debug!(threads, thread_name, "Started worker pool");

        Ok(Self {
            threads,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// The maximum number of units of work running concurrently.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queues `work` to run on the pool.
    ///
    /// Returns [`PoolShutdown`] without running `work` once [`shutdown`](Self::shutdown) was
    /// called.
    pub fn submit<F, T>(&self, work: F) -> Result<JoinHandle<T>, PoolShutdown>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(PoolShutdown)?;
        Ok(runtime.spawn_blocking(work))
    }

    /// Stops accepting new work.
    ///
    /// This does not wait for running work to finish. Work that did not start yet may be
    /// dropped without running, its handle then resolves to a cancelled [`JoinError`].
    ///
    /// [`JoinError`]: tokio::task::JoinError
    pub fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            tracing::debug!(threads = self.threads, "Shutting down worker pool");
            runtime.shutdown_background();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test::Gate;

    fn pool(threads: usize) -> WorkerPool {
        WorkerPool::new(threads, "test-worker", Duration::from_secs(10)).unwrap()
    }

    #[tokio::test]
    async fn test_runs_work() {
        let pool = pool(2);
        let handle = pool.submit(|| 40 + 2).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_runs_on_named_threads() {
        let pool = pool(1);
        let name = pool
            .submit(|| std::thread::current().name().map(str::to_owned))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let pool = pool(2);
        let gate = Gate::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let gate = gate.clone();
                let running = Arc::clone(&running);
                let max_running = Arc::clone(&max_running);
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    gate.wait();
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        crate::test::wait_until(|| running.load(Ordering::SeqCst) == 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(running.load(Ordering::SeqCst), 2);

        gate.open();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queued_work_runs_in_order() {
        let pool = pool(1);
        let gate = Gate::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let gate = gate.clone();
            pool.submit(move || gate.wait()).unwrap()
        };
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || order.lock().push(i)).unwrap()
            })
            .collect();

        gate.open();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = pool(1);
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.submit(|| ()).unwrap_err(), PoolShutdown);

        // shutting down twice is fine
        pool.shutdown();
    }

    #[test]
    fn test_clamps_to_one_thread() {
        assert_eq!(pool(0).threads(), 1);
    }
}
