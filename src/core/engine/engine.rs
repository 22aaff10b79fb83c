use crate::core::block::{ContentBlock, PlaybackOffset};
use crate::core::config::PlayoutConfig;
use crate::core::engine::events::{ActiveEntrySnapshot, PlaybackEngineEvent, QueueEntrySnapshot};
use crate::core::engine::inner::InnerEngine;
use crate::core::errors::EngineResult;
use crate::core::node::{NodeId, StartType};
use crate::core::pool::RendererPool;
use crate::core::temp_provider::{ProviderId, TempNodeProvider};
use fx_callback::{Callback, Subscriber, Subscription};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Owns the playback tree, drives node state transitions, preloads
/// upcoming content, services queue mutations, and signals observers
/// (`spec.md` §4.6).
///
/// All public methods serialize through a single internal lock so that,
/// regardless of which task calls them, mutations of the tree, the render
/// hierarchy and the preload map are never interleaved (`spec.md` §5).
#[derive(Debug, Clone)]
pub struct PlaybackEngine {
    inner: Arc<InnerEngine>,
}

impl PlaybackEngine {
    /// Construct a new engine. `default_block` is the title-slate-style
    /// fallback shown whenever the primary branch would otherwise become
    /// empty; `pool` must already have its content-type factories
    /// registered before nodes can be started.
    pub fn new(default_block: ContentBlock, config: PlayoutConfig, pool: RendererPool) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(InnerEngine::new(default_block, config, pool, message_tx));

        let inner_main = inner.clone();
        tokio::spawn(async move {
            inner_main.start(message_rx).await;
        });

        Self { inner }
    }

    pub async fn enqueue(&self, block: ContentBlock) -> NodeId {
        self.inner.enqueue(block).await
    }

    pub async fn enqueue_relative(
        &self,
        block: ContentBlock,
        target: NodeId,
        start_type: StartType,
        offset: Option<PlaybackOffset>,
    ) -> EngineResult<NodeId> {
        self.inner.enqueue_relative(block, target, start_type, offset).await
    }

    pub async fn dequeue(&self, node: NodeId) -> EngineResult<()> {
        self.inner.dequeue(node).await
    }

    pub async fn update(&self, node: NodeId, block: ContentBlock) -> EngineResult<()> {
        self.inner.update(node, block).await
    }

    pub async fn reorder(&self, source: NodeId, destination: NodeId, place_before: bool) -> EngineResult<()> {
        self.inner.reorder(source, destination, place_before).await
    }

    pub async fn skip(&self) -> EngineResult<()> {
        self.inner.skip().await
    }

    pub async fn restart(&self) -> EngineResult<()> {
        self.inner.restart().await
    }

    pub async fn stop_to_default(&self) -> EngineResult<()> {
        self.inner.stop_to_default().await
    }

    pub async fn queue_snapshot(&self) -> Vec<QueueEntrySnapshot> {
        self.inner.queue_snapshot().await
    }

    pub async fn active_snapshot(&self) -> Vec<ActiveEntrySnapshot> {
        self.inner.active_snapshot().await
    }

    /// Register a dynamic-overlay provider (`spec.md` §4.7). Providers with
    /// a higher `priority` are evaluated, and their outputs spliced, first.
    pub async fn add_temp_node_provider(
        &self,
        priority: i32,
        provider: Arc<dyn TempNodeProvider>,
    ) -> ProviderId {
        self.inner.register_temp_provider(priority, provider).await
    }

    pub async fn remove_temp_node_provider(&self, id: ProviderId) {
        self.inner.remove_temp_provider(id).await
    }

    /// Stop the engine's dispatch loop. Already-started renderers are left
    /// running; this crate does not own their teardown.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Callback<PlaybackEngineEvent> for PlaybackEngine {
    fn subscribe(&self) -> Subscription<PlaybackEngineEvent> {
        self.inner.callbacks().subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<PlaybackEngineEvent>) {
        self.inner.callbacks().subscribe_with(subscriber)
    }
}
