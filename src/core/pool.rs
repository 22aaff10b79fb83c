use crate::core::errors::{EngineError, EngineResult};
use crate::core::media::MediaKind;
use crate::core::renderer::Renderer;
use fx_handle::Handle;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Produces fresh [`Renderer`] instances for a single [`MediaKind`].
///
/// A concrete factory (VLC process wrapper, headless web view, RTMP ingest
/// adapter, graphics-layer compositor client) lives outside this crate; this
/// is the seam `RendererPool` programs against.
pub trait RendererFactory: Send + Sync + fmt::Debug {
    fn create(&self) -> Arc<dyn Renderer>;
}

#[derive(Debug, Default)]
struct PoolState {
    factories: RwLock<HashMap<MediaKind, Arc<dyn RendererFactory>>>,
    free: Mutex<HashMap<MediaKind, Vec<Arc<dyn Renderer>>>>,
    closed: AtomicBool,
}

/// Owns the per-content-type [`RendererFactory`] registry and a free-list of
/// idle renderers, handing out revocable [`RendererLease`]s to the engine.
///
/// Grounded on the discovered-peer/active-peer bookkeeping of the torrent
/// stack's peer pool: a registry guarded by a lock, a bounded free-list, and
/// handles that outlive a single checkout (`spec.md` §9 "Proxy-revocation...
/// becomes a tagged lease handle").
#[derive(Debug, Clone, Default)]
pub struct RendererPool {
    state: Arc<PoolState>,
}

impl RendererPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory used to create renderers for
    /// `kind`. Replacing an existing factory is a graceful swap: renderers
    /// already leased out keep running under the old factory's instance,
    /// only future acquisitions see the new one (see `SPEC_FULL.md` §4.10).
    pub fn register_factory(&self, kind: MediaKind, factory: Arc<dyn RendererFactory>) {
        let mut factories = self.state.factories.write().unwrap();
        if factories.insert(kind, factory).is_some() {
            warn!(
                "Renderer pool is replacing the factory already registered for {}",
                kind
            );
        } else {
            debug!("Renderer pool registered a factory for {}", kind);
        }

        self.state.free.lock().unwrap().remove(&kind);
    }

    /// Acquire a renderer for `kind`, reusing an idle one from the free-list
    /// when available.
    pub fn acquire(&self, kind: MediaKind) -> EngineResult<RendererLease> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(EngineError::PoolClosed);
        }

        let renderer = {
            let mut free = self.state.free.lock().unwrap();
            free.get_mut(&kind).and_then(|pool| pool.pop())
        };

        let renderer = match renderer {
            Some(renderer) => renderer,
            None => {
                let factories = self.state.factories.read().unwrap();
                let factory = factories
                    .get(&kind)
                    .ok_or(EngineError::UnsupportedContentType(kind))?;
                factory.create()
            }
        };

        Ok(RendererLease {
            inner: Arc::new(LeaseInner {
                id: Handle::new(),
                kind,
                renderer,
                revoked: AtomicBool::new(false),
                pool: self.state.clone(),
            }),
        })
    }

    /// Stop handing out new leases. Leases already acquired remain valid
    /// until individually released.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

struct LeaseInner {
    id: Handle,
    kind: MediaKind,
    renderer: Arc<dyn Renderer>,
    revoked: AtomicBool,
    pool: Arc<PoolState>,
}

impl fmt::Debug for LeaseInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseInner")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("revoked", &self.revoked.load(Ordering::SeqCst))
            .finish()
    }
}

/// A revocable handle to a leased [`Renderer`].
///
/// `release()` flips an atomic flag rather than tearing anything down
/// immediately: any in-flight use of the renderer observed through this
/// lease after release surfaces [`EngineError::LeaseRevoked`] instead of
/// touching a renderer another node may already be reusing
/// (`spec.md` §9).
#[derive(Debug, Clone)]
pub struct RendererLease {
    inner: Arc<LeaseInner>,
}

impl RendererLease {
    pub fn id(&self) -> Handle {
        self.inner.id
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    /// Borrow the underlying renderer, failing once the lease has been
    /// released.
    pub fn renderer(&self) -> EngineResult<&Arc<dyn Renderer>> {
        if self.is_revoked() {
            Err(EngineError::LeaseRevoked)
        } else {
            Ok(&self.inner.renderer)
        }
    }

    /// Revoke this lease and return the renderer to the pool's free-list for
    /// reuse, unless the pool has since been closed.
    pub fn release(&self) {
        if self.inner.revoked.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.inner.pool.closed.load(Ordering::SeqCst) {
            self.inner
                .pool
                .free
                .lock()
                .unwrap()
                .entry(self.inner.kind)
                .or_default()
                .push(self.inner.renderer.clone());
        }
    }
}

impl PartialEq for RendererLease {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::media::{LocationStatus, MediaDuration, MediaLocation, MediaObject};
    use crate::core::renderer::{ListenerId, ProgressCallback, RendererState, SourceHandle};
    use async_trait::async_trait;
    use fx_callback::{Callback, MultiThreadedCallback, Subscription};

    #[derive(Debug)]
    struct StubRenderer {
        id: Handle,
        callback: MultiThreadedCallback<crate::core::renderer::RendererEvent>,
    }

    impl Callback<crate::core::renderer::RendererEvent> for StubRenderer {
        fn subscribe(&self) -> Subscription<crate::core::renderer::RendererEvent> {
            self.callback.subscribe()
        }

        fn subscribe_with(
            &self,
            subscriber: fx_callback::Subscriber<crate::core::renderer::RendererEvent>,
        ) {
            self.callback.subscribe_with(subscriber)
        }
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        fn id(&self) -> Handle {
            self.id
        }

        fn source_handle(&self) -> SourceHandle {
            Handle::new()
        }

        async fn load_media(&self, _media: MediaObject) {}

        async fn play(&self) {}

        async fn restart(&self) {}

        async fn stop_and_unload(&self) {}

        async fn loaded_media(&self) -> Option<MediaObject> {
            None
        }

        async fn current_progress_ms(&self) -> u64 {
            0
        }

        async fn state(&self) -> RendererState {
            RendererState::Idle
        }

        async fn once_progress(
            &self,
            _offset: crate::core::block::PlaybackOffset,
            _callback: ProgressCallback,
        ) -> EngineResult<ListenerId> {
            Ok(Handle::new())
        }

        async fn off(&self, _listener: ListenerId) {}
    }

    #[derive(Debug)]
    struct StubFactory;

    impl RendererFactory for StubFactory {
        fn create(&self) -> Arc<dyn Renderer> {
            Arc::new(StubRenderer {
                id: Handle::new(),
                callback: MultiThreadedCallback::new(),
            })
        }
    }

    fn media() -> MediaObject {
        MediaObject::new(
            "Foo",
            MediaKind::LocalFile,
            MediaLocation::new("/tmp/foo.mp4", LocationStatus::Ready),
            MediaDuration::Finite(1000),
        )
    }

    #[test]
    fn test_acquire_without_factory_is_unsupported() {
        let pool = RendererPool::new();

        let result = pool.acquire(MediaKind::LocalFile);

        assert_eq!(
            Err(EngineError::UnsupportedContentType(MediaKind::LocalFile)),
            result
        );
    }

    #[test]
    fn test_acquire_and_release_reuses_renderer() {
        let pool = RendererPool::new();
        pool.register_factory(MediaKind::LocalFile, Arc::new(StubFactory));

        let lease = pool.acquire(MediaKind::LocalFile).unwrap();
        let renderer_id = lease.renderer().unwrap().id();
        lease.release();

        let second_lease = pool.acquire(MediaKind::LocalFile).unwrap();
        assert_eq!(renderer_id, second_lease.renderer().unwrap().id());
    }

    #[test]
    fn test_released_lease_is_revoked() {
        let pool = RendererPool::new();
        pool.register_factory(MediaKind::LocalFile, Arc::new(StubFactory));

        let lease = pool.acquire(MediaKind::LocalFile).unwrap();
        lease.release();

        assert!(lease.is_revoked());
        assert_eq!(Err(EngineError::LeaseRevoked), lease.renderer().map(|_| ()));
    }

    #[test]
    fn test_closed_pool_rejects_new_acquisitions() {
        let pool = RendererPool::new();
        pool.register_factory(MediaKind::LocalFile, Arc::new(StubFactory));
        pool.close();

        let result = pool.acquire(MediaKind::LocalFile);

        assert_eq!(Err(EngineError::PoolClosed), result);
    }

    #[test]
    fn test_replacing_factory_clears_free_list() {
        let pool = RendererPool::new();
        pool.register_factory(MediaKind::LocalFile, Arc::new(StubFactory));
        let lease = pool.acquire(MediaKind::LocalFile).unwrap();
        let first_id = lease.renderer().unwrap().id();
        lease.release();

        pool.register_factory(MediaKind::LocalFile, Arc::new(StubFactory));
        let new_lease = pool.acquire(MediaKind::LocalFile).unwrap();

        assert_ne!(first_id, new_lease.renderer().unwrap().id());
        let _ = media();
    }
}
