//! The traits connecting a [`Loader`](crate::Loader) to the code producing and consuming artifacts.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// A value that can be held by the [`SizedCache`](crate::SizedCache).
pub trait Artifact {
    /// The number of bytes this artifact accounts for against the cache capacity.
    ///
    /// The size is read once when the artifact is inserted into the cache, so it must not change
    /// afterwards.
    fn byte_size(&self) -> u64;
}

impl Artifact for Vec<u8> {
    fn byte_size(&self) -> u64 {
        self.len() as u64
    }
}

impl Artifact for Box<[u8]> {
    fn byte_size(&self) -> u64 {
        self.len() as u64
    }
}

impl Artifact for String {
    fn byte_size(&self) -> u64 {
        self.len() as u64
    }
}

/// Produces the artifact for a key.
///
/// The producer is invoked on a worker thread of the loader, never on the thread calling
/// [`Loader::request`](crate::Loader::request). Long running producers should check the
/// `cancel` token and bail out early once the loader is closed, the result of a cancelled
/// computation is discarded either way.
///
/// Failures have to be mapped to `None`, listeners can not tell a failed computation apart from
/// one that legitimately yielded no artifact.
pub trait ArtifactProducer<K, V>: Send + Sync + 'static {
    /// Computes the artifact for `key`.
    fn produce(&self, key: &K, cancel: &CancellationToken) -> Option<V>;
}

impl<K, V, F> ArtifactProducer<K, V> for F
where
    F: Fn(&K, &CancellationToken) -> Option<V> + Send + Sync + 'static,
{
    fn produce(&self, key: &K, cancel: &CancellationToken) -> Option<V> {
        self(key, cancel)
    }
}

/// Receives the outcome of a [`Loader::request`](crate::Loader::request).
///
/// For an accepted request, [`on_loading`](Listener::on_loading) is called exactly once, followed
/// by exactly one call to [`on_loaded`](Listener::on_loaded), unless the loader is closed while
/// the computation is still in flight.
///
/// Cache hits are reported synchronously on the requesting thread with `animate` set to `false`.
/// Freshly computed artifacts are reported on a worker thread with `animate` set to `true`. A
/// panic in `on_loaded` on a worker thread is logged and does not affect other listeners.
pub trait Listener<K, V>: Send + Sync {
    /// The request was accepted and is either answered from the cache or being computed.
    fn on_loading(&self);

    /// The request finished.
    ///
    /// `value` is `None` if the producer did not yield an artifact.
    fn on_loaded(&self, key: &K, value: Option<Arc<V>>, animate: bool);
}

impl<K, V, L> Listener<K, V> for Arc<L>
where
    L: Listener<K, V> + ?Sized,
{
    fn on_loading(&self) {
        (**self).on_loading()
    }

    fn on_loaded(&self, key: &K, value: Option<Arc<V>>, animate: bool) {
        (**self).on_loaded(key, value, animate)
    }
}

impl<K, V, L> Listener<K, V> for Box<L>
where
    L: Listener<K, V> + ?Sized,
{
    fn on_loading(&self) {
        (**self).on_loading()
    }

    fn on_loaded(&self, key: &K, value: Option<Arc<V>>, animate: bool) {
        (**self).on_loaded(key, value, animate)
    }
}
