use crate::core::block::PlaybackOffset;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::media::MediaObject;
use async_trait::async_trait;
use derive_more::Display;
use fx_callback::Callback;
use fx_handle::Handle;
use std::fmt::Debug;

/// Opaque handle a [`Renderer`] exposes to the compositor adapter so the
/// [`crate::core::hierarchy::RenderHierarchy`] can insert/remove it without
/// knowing anything about the renderer's concrete content type
/// (`spec.md` §6.1).
pub type SourceHandle = Handle;

/// The identifier of a [`ProgressListenerBus`] subscription.
pub type ListenerId = Handle;

/// The lifecycle states a [`Renderer`] publishes (`spec.md` §4.5).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum RendererState {
    Idle,
    Loading,
    Ready,
    Playing,
    Stalled,
    Finished,
    Error,
}

/// Events published on a renderer's status stream.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum RendererEvent {
    #[display(fmt = "renderer state changed to {}", _0)]
    StateChanged(RendererState),
    #[display(fmt = "renderer progress changed to {}ms", _0)]
    ProgressChanged(u64),
}

/// The capability contract every content-type renderer must implement
/// (`spec.md` §4.5, §6.1). Concrete implementations (VLC/HTML/RTMP/web
/// players, etc.) are external collaborators out of this crate's scope;
/// this trait is the seam the engine programs against.
#[async_trait]
pub trait Renderer: Debug + Callback<RendererEvent> + Send + Sync {
    /// A stable identifier assigned by the [`crate::core::pool::RendererPool`]
    /// at acquisition time.
    fn id(&self) -> Handle;

    /// The opaque compositor-source handle the hierarchy inserts/removes.
    fn source_handle(&self) -> SourceHandle;

    async fn load_media(&self, media: MediaObject);

    async fn play(&self);

    async fn restart(&self);

    async fn stop_and_unload(&self);

    async fn loaded_media(&self) -> Option<MediaObject>;

    async fn current_progress_ms(&self) -> u64;

    async fn state(&self) -> RendererState;

    /// Subscribe to be notified exactly once when playback crosses `offset`,
    /// evaluated against the currently loaded media (`spec.md` §4.8).
    async fn once_progress(
        &self,
        offset: PlaybackOffset,
        callback: ProgressCallback,
    ) -> EngineResult<ListenerId>;

    /// Cancel a previously registered `once_progress` subscription. A
    /// listener that already fired or was never registered is a no-op.
    async fn off(&self, listener: ListenerId);
}

/// A one-shot callback invoked by a [`ProgressListenerBus`] when playback
/// crosses the registered offset.
pub type ProgressCallback = Box<dyn FnOnce() + Send + 'static>;

/// A pending `once_progress` registration, keyed by its evaluated absolute
/// millisecond offset from playback start.
struct PendingListener {
    id: ListenerId,
    absolute_ms: u64,
    callback: Option<ProgressCallback>,
}

/// The shared, reusable "fire once when progress crosses an offset"
/// primitive named in `spec.md` §4.8. It is a pure data structure: a
/// concrete [`Renderer`] implementation owns one and calls [`Self::poll`]
/// at its own internal tick resolution (at least every 100ms, per spec).
///
/// This is the "ad hoc promise resolver stored in a map" pattern from
/// `spec.md` §9, made concrete as a single-shot callback indexed by
/// listener id, removed exactly once it fires or is cancelled.
#[derive(Default)]
pub struct ProgressListenerBus {
    pending: Vec<PendingListener>,
}

impl ProgressListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to fire once playback reaches `offset`,
    /// evaluated now against `duration`.
    pub fn once(
        &mut self,
        offset: PlaybackOffset,
        duration: crate::core::media::MediaDuration,
        callback: ProgressCallback,
    ) -> EngineResult<ListenerId> {
        let absolute_ms = offset.evaluate(duration)?;
        let id = Handle::new();

        self.pending.push(PendingListener {
            id,
            absolute_ms,
            callback: Some(callback),
        });

        Ok(id)
    }

    pub fn off(&mut self, id: ListenerId) {
        self.pending.retain(|listener| listener.id != id);
    }

    /// Check `progress_ms` against every pending listener, firing (and
    /// removing) each whose absolute offset has been reached, in
    /// non-decreasing order of their evaluated absolute time
    /// (`spec.md` §4.8).
    pub fn poll(&mut self, progress_ms: u64) {
        self.pending.sort_by_key(|listener| listener.absolute_ms);

        let mut remaining = Vec::with_capacity(self.pending.len());
        for mut listener in self.pending.drain(..) {
            if listener.absolute_ms <= progress_ms {
                if let Some(callback) = listener.callback.take() {
                    callback();
                }
            } else {
                remaining.push(listener);
            }
        }

        self.pending = remaining;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for ProgressListenerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressListenerBus")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Helper used by [`crate::core::pool::RendererPool`] to validate an
/// acquired renderer matches the requested content type before handing out
/// a lease.
pub fn require_supported(
    kind: crate::core::media::MediaKind,
    supported: &[crate::core::media::MediaKind],
) -> EngineResult<()> {
    if supported.contains(&kind) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedContentType(kind))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::media::MediaDuration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_progress_bus_fires_once() {
        let mut bus = ProgressListenerBus::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        bus.once(
            PlaybackOffset::MsAfterStart(1000),
            MediaDuration::Finite(5000),
            Box::new(move || fired_clone.store(true, Ordering::SeqCst)),
        )
        .unwrap();

        bus.poll(500);
        assert!(!fired.load(Ordering::SeqCst), "should not fire early");

        bus.poll(1000);
        assert!(fired.load(Ordering::SeqCst), "should fire once reached");

        fired.store(false, Ordering::SeqCst);
        bus.poll(2000);
        assert!(!fired.load(Ordering::SeqCst), "must not fire a second time");
    }

    #[test]
    fn test_progress_bus_off_cancels() {
        let mut bus = ProgressListenerBus::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let id = bus
            .once(
                PlaybackOffset::MsAfterStart(1000),
                MediaDuration::Finite(5000),
                Box::new(move || fired_clone.store(true, Ordering::SeqCst)),
            )
            .unwrap();

        bus.off(id);
        bus.poll(2000);

        assert!(!fired.load(Ordering::SeqCst));
        assert!(bus.is_empty());
    }

    #[test]
    fn test_progress_bus_fires_in_order() {
        let mut bus = ProgressListenerBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for ms in [3000u64, 1000, 2000] {
            let order_clone = order.clone();
            bus.once(
                PlaybackOffset::MsAfterStart(ms),
                MediaDuration::Finite(5000),
                Box::new(move || order_clone.lock().unwrap().push(ms)),
            )
            .unwrap();
        }

        bus.poll(5000);

        assert_eq!(vec![1000, 2000, 3000], *order.lock().unwrap());
    }

    #[test]
    fn test_require_supported() {
        use crate::core::media::MediaKind;

        let result = require_supported(MediaKind::LocalFile, &[MediaKind::WebStream]);

        assert_eq!(
            Err(EngineError::UnsupportedContentType(MediaKind::LocalFile)),
            result
        );
    }
}
