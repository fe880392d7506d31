//! A deduplicating loader cache for expensive, synchronously produced artifacts.
//!
//! A [`Loader`] answers requests for keys in one of three ways:
//!
//! - If an artifact for the key is resident in the in-memory [`SizedCache`], the listener is
//!   notified synchronously on the calling thread.
//! - If a computation for the key is already in flight, the request is coalesced with it
//!   (see [`DuplicatePolicy`]).
//! - Otherwise a new computation is registered in the [`TaskRegistry`] and submitted to the
//!   fixed-size [`WorkerPool`], which invokes the [`ArtifactProducer`] and notifies the listener
//!   from the worker thread once the artifact is available.
//!
//! The cache is bounded by the byte size each [`Artifact`] reports rather than by the number of
//! entries, and evicts least recently used entries first.
//!
//! [`Loader::close`] tears everything down: queued and running computations are cancelled
//! cooperatively, their listeners are never notified, and the cache is emptied.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod listener;
pub mod loader;
pub mod logging;
pub mod pool;
pub mod registry;


pub use cache::SizedCache;
pub use config::{Config, DuplicatePolicy};
pub use listener::{Artifact, ArtifactProducer, Listener};
pub use loader::{Loader, LoaderStats, MAX_CACHE_BYTES, MAX_THREADS};
pub use pool::{PoolShutdown, WorkerPool};
pub use registry::{InFlightTask, TaskRegistry};
pub use tokio_util::sync::CancellationToken;
