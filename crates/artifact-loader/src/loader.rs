use std::fmt;
use std::hash::Hash;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::SizedCache;
use crate::config::{Config, DuplicatePolicy};
use crate::listener::{Artifact, ArtifactProducer, Listener};
use crate::pool::WorkerPool;
use crate::registry::{SharedListener, TaskRegistry};

/// The upper bound for the number of worker threads of a [`Loader`].
pub const MAX_THREADS: usize = 4;

/// The upper bound for the capacity of the cache of a [`Loader`], in bytes.
pub const MAX_CACHE_BYTES: u64 = 8 * 1024 * 1024;

/// A snapshot of the state of a [`Loader`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// The number of artifacts resident in the cache.
    pub cached_entries: usize,
    /// The accumulated size of all resident artifacts.
    pub cached_bytes: u64,
    /// The capacity of the cache after clamping.
    pub cache_capacity: u64,
    /// The number of computations submitted to the worker pool that did not finish yet.
    pub in_flight: usize,
    /// Whether the loader was closed.
    pub closed: bool,
}

/// Everything a request decision is made on, guarded by one lock.
struct State<K, V> {
    cache: SizedCache<K, V>,
    tasks: TaskRegistry<K, V>,
    closed: bool,
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    pool: WorkerPool,
    producer: Box<dyn ArtifactProducer<K, V>>,
    duplicate_policy: DuplicatePolicy,
}

/// The outcome of looking up a request.
enum Decision<V> {
    Closed,
    InFlight,
    Hit(Arc<V>),
    Scheduled(u64, CancellationToken),
}

/// Loads artifacts on a fixed pool of worker threads, deduplicating concurrent requests and
/// caching the results in memory.
///
/// See the [crate documentation](crate) for an overview of how requests are handled.
///
/// Dropping the loader [closes](Self::close) it.
pub struct Loader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Artifact + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Loader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Artifact + Send + Sync + 'static,
{
    /// Creates a new loader running `producer` on up to `max_threads` worker threads and keeping
    /// up to `max_cache_bytes` worth of artifacts in memory.
    ///
    /// Both limits are clamped to [`MAX_THREADS`] and [`MAX_CACHE_BYTES`] respectively, and at
    /// least one worker thread is used.
    pub fn new<P>(max_threads: usize, max_cache_bytes: u64, producer: P) -> io::Result<Self>
    where
        P: ArtifactProducer<K, V>,
    {
        let config = Config {
            max_threads,
            max_cache_bytes,
            ..Config::default()
        };
        Self::from_config(&config, producer)
    }

    /// Creates a new loader from its [`Config`].
    ///
    /// The limits are clamped just like in [`Loader::new`].
    pub fn from_config<P>(config: &Config, producer: P) -> io::Result<Self>
    where
        P: ArtifactProducer<K, V>,
    {
        let threads = config.max_threads.clamp(1, MAX_THREADS);
        let capacity = config.max_cache_bytes.min(MAX_CACHE_BYTES);

        let pool = WorkerPool::new(threads, &config.thread_name, config.worker_keep_alive)?;
        let state = State {
            cache: SizedCache::new(capacity),
            tasks: TaskRegistry::new(),
            closed: false,
        };

        tracing::debug!(
            threads,
            capacity,
            duplicate_policy = ?config.duplicate_policy,
            "Created loader"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                pool,
                producer: Box::new(producer),
                duplicate_policy: config.duplicate_policy,
            }),
        })
    }

    /// Requests the artifact for `key`.
    ///
    /// This never blocks on a computation:
    ///
    /// - If the loader is closed, nothing happens.
    /// - If the artifact is cached, `listener` is notified right away on the calling thread, with
    ///   `animate` set to `false`.
    /// - If the artifact is already being computed, the `listener` is dropped without being
    ///   notified, or attached to the running computation if the loader was configured with
    ///   [`DuplicatePolicy::FanOut`].
    /// - Otherwise, [`Listener::on_loading`] is called on the calling thread and the computation
    ///   is queued on the worker pool. [`Listener::on_loaded`] is called from the worker thread
    ///   once the producer returns.
    ///
    /// Listeners are never invoked while internal locks are held, so they may call back into the
    /// loader.
    pub fn request<L>(&self, key: K, listener: L)
    where
        L: Listener<K, V> + 'static,
    {
        let listener: SharedListener<K, V> = Arc::new(listener);

        // Attached listeners are announced before the task can possibly complete.
        let announced = match self.inner.duplicate_policy {
            DuplicatePolicy::Drop => false,
            DuplicatePolicy::FanOut => {
                if self.is_closed() {
                    metric!(counter("loader.request") += 1, "outcome" => "closed");
                    return;
                }
                listener.on_loading();
                true
            }
        };

        let decision = self.decide(&key, &listener);

        match decision {
            Decision::Closed => {
                tracing::trace!("Loader is closed, ignoring request");
                metric!(counter("loader.request") += 1, "outcome" => "closed");
            }
            Decision::InFlight => {
                metric!(counter("loader.request") += 1, "outcome" => "dedup");
            }
            Decision::Hit(value) => {
                metric!(counter("loader.request") += 1, "outcome" => "hit");
                if !announced {
                    listener.on_loading();
                }
                listener.on_loaded(&key, Some(value), false);
            }
            Decision::Scheduled(id, cancel) => {
                metric!(counter("loader.request") += 1, "outcome" => "miss");
                if !announced {
                    listener.on_loading();
                }
                drop(listener);
                self.submit(key, id, cancel);
            }
        }
    }

    /// Checks the cache and the computations in flight for `key`, registering a new computation
    /// if there is neither.
    fn decide(&self, key: &K, listener: &SharedListener<K, V>) -> Decision<V> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Decision::Closed;
        }

        match self.inner.duplicate_policy {
            DuplicatePolicy::Drop => {
                if state.tasks.contains(key) {
                    tracing::trace!("Computation already in flight, dropping listener");
                    return Decision::InFlight;
                }
            }
            DuplicatePolicy::FanOut => {
                if state.tasks.attach(key, Arc::clone(listener)).is_ok() {
                    tracing::trace!("Computation already in flight, attaching listener");
                    return Decision::InFlight;
                }
            }
        }

        if let Some(value) = state.cache.get(key) {
            return Decision::Hit(value);
        }

        match state.tasks.register(key.clone(), Arc::clone(listener)) {
            Some((id, cancel)) => {
                metric!(gauge("loader.tasks.in_flight") = state.tasks.len() as u64);
                Decision::Scheduled(id, cancel)
            }
            None => Decision::InFlight,
        }
    }

    fn submit(&self, key: K, id: u64, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let submitted = Instant::now();
        let work = move || inner.run(key, id, cancel, submitted);

        if let Err(err) = self.inner.pool.submit(work) {
            // `close` raced us, and already cancelled the registered task
            tracing::debug!(error = &err as &dyn std::error::Error, "Dropping computation");
        }
    }

    /// Shuts the loader down.
    ///
    /// Stops the worker pool, cancels all computations in flight without notifying their
    /// listeners, and empties the cache. Subsequent requests are ignored. Closing a loader more
    /// than once has no further effect.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// The number of worker threads after clamping.
    pub fn threads(&self) -> usize {
        self.inner.pool.threads()
    }

    /// Returns a snapshot of the current cache and computation state.
    pub fn stats(&self) -> LoaderStats {
        let state = self.inner.state.lock();
        LoaderStats {
            cached_entries: state.cache.len(),
            cached_bytes: state.cache.total_size(),
            cache_capacity: state.cache.capacity(),
            in_flight: state.tasks.len(),
            closed: state.closed,
        }
    }
}

impl<K, V> Inner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Artifact + Send + Sync + 'static,
{
    /// Runs the computation `id` for `key` on a worker thread, and reports its result.
    fn run(&self, key: K, id: u64, cancel: CancellationToken, submitted: Instant) {
        if cancel.is_cancelled() {
            metric!(counter("loader.computation") += 1, "status" => "cancelled");
            return;
        }
        metric!(timer("loader.computation.wait_time") = submitted.elapsed());

        let start = Instant::now();
        let value = match catch_unwind(AssertUnwindSafe(|| self.producer.produce(&key, &cancel))) {
            Ok(value) => value.map(Arc::new),
            Err(_) => {
                tracing::error!("Artifact producer panicked");
                metric!(counter("loader.computation") += 1, "status" => "panicked");
                None
            }
        };
        let duration = start.elapsed();

        let Some(listeners) = self.finish(&key, id, &cancel, value.as_ref(), duration) else {
            metric!(counter("loader.computation") += 1, "status" => "cancelled");
            return;
        };

        // a panicking listener must not keep the others from being notified
        for listener in listeners {
            let notify = || listener.on_loaded(&key, value.clone(), true);
            if catch_unwind(AssertUnwindSafe(notify)).is_err() {
                tracing::error!("Listener panicked while being notified");
                metric!(counter("loader.listener.panicked") += 1);
            }
        }
    }

    /// Unregisters the finished task and caches its artifact, in one step.
    ///
    /// Returns the listeners to notify, or `None` if the task was cancelled.
    fn finish(
        &self,
        key: &K,
        id: u64,
        cancel: &CancellationToken,
        value: Option<&Arc<V>>,
        duration: Duration,
    ) -> Option<Vec<SharedListener<K, V>>> {
        let mut state = self.state.lock();
        // `close` cancels tasks while holding the lock, so this can not race
        if cancel.is_cancelled() {
            return None;
        }
        let task = state.tasks.complete(key, id)?;

        match value {
            Some(value) => {
                let evicted = state.cache.put(key.clone(), Arc::clone(value));
                if evicted > 0 {
                    metric!(counter("loader.cache.evicted") += evicted as i64);
                }
                metric!(gauge("loader.cache.bytes") = state.cache.total_size());
                metric!(time_raw("loader.artifact.size") = value.byte_size());
                metric!(counter("loader.computation") += 1, "status" => "loaded");
                tracing::debug!(?duration, evicted, "Loaded artifact");
            }
            None => {
                metric!(counter("loader.computation") += 1, "status" => "empty");
                tracing::debug!(?duration, "Producer yielded no artifact");
            }
        }
        metric!(timer("loader.computation.duration") = duration);
        metric!(gauge("loader.tasks.in_flight") = state.tasks.len() as u64);

        Some(task.into_listeners())
    }

    fn close(&self) {
        let cancelled = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            self.pool.shutdown();
            let cancelled = state.tasks.cancel_all();
            state.cache.evict_all();
            cancelled
        };

        tracing::debug!(cancelled = cancelled.len(), "Closed loader");
        metric!(gauge("loader.tasks.in_flight") = 0u64);
        metric!(gauge("loader.cache.bytes") = 0u64);
        // the listeners of cancelled tasks are dropped here, outside of the lock
        drop(cancelled);
    }
}

impl<K, V> Drop for Loader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Artifact + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<K, V> fmt::Debug for Loader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Artifact + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Loader")
            .field("pool", &self.inner.pool)
            .field("cache", &state.cache)
            .field("tasks", &state.tasks)
            .field("closed", &state.closed)
            .field("duplicate_policy", &self.inner.duplicate_policy)
            .finish()
    }
}
