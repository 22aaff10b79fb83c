use crate::core::block::{ContentBlock, PlaybackOffset};
use crate::core::config::PlayoutConfig;
use crate::core::engine::events::{queue_entry_snapshot, ActiveEntrySnapshot, PlaybackEngineEvent};
use crate::core::errors::{EngineError, EngineResult};
use crate::core::hierarchy::RenderHierarchy;
use crate::core::media::MediaKind;
use crate::core::node::{NodeId, NodeStatus, PlaybackNode, StartType};
use crate::core::pool::{RendererLease, RendererPool};
use crate::core::renderer::{ListenerId, RendererEvent, RendererState};
use crate::core::temp_provider::{ProviderId, TempNodeProvider, TempNodeProviderRegistry};
use crate::core::tree::PlaybackTree;
use fx_callback::{Callback, MultiThreadedCallback};
use log::{debug, error, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Messages the engine's single dispatch task consumes (`spec.md` §5, §9
/// "Coroutine-style progression via chained callbacks becomes a state-machine
/// dispatch loop"). Every deferred effect mentioned in §5 ("Suspension
/// points") resolves by sending one of these back onto this channel rather
/// than mutating engine state from whatever task observed it.
#[derive(Debug)]
pub(crate) enum EngineMessage {
    Renderer(NodeId, RendererEvent),
    TransitionInComplete(NodeId),
    ChildStart(NodeId, NodeId),
    FinalizeStop(NodeId),
    RetryDefault,
}

/// Everything the dispatch loop and the public command methods mutate.
/// Guarded by a single [`Mutex`] so every mutation is serialized regardless
/// of whether it originated from a command call or from the dispatch loop
/// (`spec.md` §5 "this eliminates the need for locks inside the tree").
struct EngineState {
    tree: PlaybackTree,
    hierarchy: RenderHierarchy,
    temp_providers: TempNodeProviderRegistry,
    preloaded: HashMap<NodeId, RendererLease>,
    node_layer: HashMap<NodeId, usize>,
    node_listeners: HashMap<NodeId, Vec<ListenerId>>,
    front: HashSet<NodeId>,
    retry_backoff_ms: u64,
}

pub(crate) struct InnerEngine {
    state: Mutex<EngineState>,
    pool: RendererPool,
    config: PlayoutConfig,
    default_block: ContentBlock,
    callbacks: MultiThreadedCallback<PlaybackEngineEvent>,
    cancellation_token: CancellationToken,
    message_tx: mpsc::UnboundedSender<EngineMessage>,
}

impl InnerEngine {
    pub(crate) fn new(
        default_block: ContentBlock,
        config: PlayoutConfig,
        pool: RendererPool,
        message_tx: mpsc::UnboundedSender<EngineMessage>,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState {
                tree: PlaybackTree::new(),
                hierarchy: RenderHierarchy::new(config.max_active_renderers),
                temp_providers: TempNodeProviderRegistry::new(),
                preloaded: HashMap::new(),
                node_layer: HashMap::new(),
                node_listeners: HashMap::new(),
                front: HashSet::new(),
                retry_backoff_ms: config.default_retry_initial_ms,
            }),
            pool,
            config,
            default_block,
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
            message_tx,
        }
    }

    pub(crate) fn callbacks(&self) -> &MultiThreadedCallback<PlaybackEngineEvent> {
        &self.callbacks
    }

    pub(crate) fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// The dispatch loop: the single logical task `spec.md` §5 requires all
    /// renderer-observed events to be marshalled onto before touching tree
    /// state.
    pub(crate) async fn start(&self, mut messages: mpsc::UnboundedReceiver<EngineMessage>) {
        self.startup().await;

        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                Some(message) = messages.recv() => self.handle_message(message).await,
                else => break,
            }
        }

        debug!("Playback engine dispatch loop ended");
    }

    async fn handle_message(&self, message: EngineMessage) {
        match message {
            EngineMessage::Renderer(node, event) => self.handle_renderer_event(node, event).await,
            EngineMessage::TransitionInComplete(node) => self.complete_transition_in(node).await,
            EngineMessage::ChildStart(parent, child) => self.handle_child_start(parent, child).await,
            EngineMessage::FinalizeStop(node) => self.finalize_stop(node).await,
            EngineMessage::RetryDefault => self.startup().await,
        }
    }

    async fn handle_renderer_event(&self, node: NodeId, event: RendererEvent) {
        match event {
            RendererEvent::StateChanged(RendererState::Finished) => self.on_node_finished(node).await,
            RendererEvent::StateChanged(RendererState::Error) => self.on_node_error(node).await,
            RendererEvent::StateChanged(RendererState::Stalled) => {
                warn!("Renderer for node {} stalled", node);
            }
            RendererEvent::StateChanged(RendererState::Idle) => self.on_renderer_idle(node).await,
            RendererEvent::StateChanged(RendererState::Ready) => {
                trace!("Renderer for node {} is ready", node);
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------
    // Startup & default-block fallback (`spec.md` §4.6 "Startup", §7)
    // ---------------------------------------------------------------

    async fn startup(&self) {
        let mut state = self.state.lock().await;
        if state.tree.root().is_some() {
            return;
        }
        drop(state);

        match self.spawn_default_node().await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.retry_backoff_ms = self.config.default_retry_initial_ms;
            }
            Err(err) => {
                error!("Failed to start default block: {}", err);
                self.schedule_default_retry().await;
            }
        }
    }

    async fn spawn_default_node(&self) -> EngineResult<()> {
        let node_id = fx_handle::Handle::new();
        let node = PlaybackNode::new(node_id, self.default_block.clone(), StartType::Sequenced, None);

        {
            let mut state = self.state.lock().await;
            state.tree.set_root(node);
        }

        self.start_node(node_id, 0).await
    }

    async fn schedule_default_retry(&self) {
        let delay_ms = {
            let mut state = self.state.lock().await;
            let delay = state.retry_backoff_ms;
            state.retry_backoff_ms = (delay * 2).min(self.config.default_retry_max_ms);
            delay
        };

        let tx = self.message_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(EngineMessage::RetryDefault);
        });
    }

    // ---------------------------------------------------------------
    // Starting a node (`spec.md` §4.6 "Starting a node")
    // ---------------------------------------------------------------

    async fn start_node(&self, node_id: NodeId, layer: usize) -> EngineResult<()> {
        let kind = {
            let state = self.state.lock().await;
            state
                .tree
                .get(node_id)
                .ok_or(EngineError::UnknownNode(node_id))?
                .block
                .media
                .kind
        };

        let lease = {
            let mut state = self.state.lock().await;
            if let Some(preloaded) = state.preloaded.remove(&node_id) {
                preloaded
            } else {
                self.pool.acquire(kind)?
            }
        };

        {
            let mut state = self.state.lock().await;
            if let Some(node) = state.tree.get_mut(node_id) {
                node.renderer = Some(lease.clone());
            }
            state.front.insert(node_id);
            state.node_layer.insert(node_id, layer);
        }

        let renderer = lease.renderer()?.clone();
        let media = {
            let state = self.state.lock().await;
            state
                .tree
                .get(node_id)
                .map(|node| node.block.media.clone())
                .ok_or(EngineError::UnknownNode(node_id))?
        };

        let already_loaded = renderer.loaded_media().await.as_ref() == Some(&media);
        if !already_loaded {
            renderer.load_media(media).await;
        }

        self.wait_for_ready(node_id, &lease).await?;
        self.install_listener_group(node_id, &lease).await?;

        let source = lease.renderer()?.source_handle();
        {
            let mut state = self.state.lock().await;
            state.hierarchy.insert(node_id, source)?;
        }

        let transition_in_ms = {
            let state = self.state.lock().await;
            state
                .tree
                .get(node_id)
                .map(|node| node.block.transition_in_ms)
                .unwrap_or(0)
        };

        if transition_in_ms > 0 {
            self.set_status(node_id, NodeStatus::TransitioningIn).await;
            let tx = self.message_tx.clone();
            let listener = lease
                .renderer()?
                .once_progress(
                    PlaybackOffset::MsAfterStart(transition_in_ms),
                    Box::new(move || {
                        let _ = tx.send(EngineMessage::TransitionInComplete(node_id));
                    }),
                )
                .await?;
            self.track_listener(node_id, listener).await;
        } else {
            self.set_status(node_id, NodeStatus::Playing).await;
        }

        lease.renderer()?.play().await;
        self.install_child_starters(node_id, &lease).await?;

        self.callbacks.invoke(PlaybackEngineEvent::ActiveBlocksChanged);
        self.preload_policy().await;

        Ok(())
    }

    /// Wait for `Ready`, logging a soft-warn (and surfacing it as an
    /// observer event, `SPEC_FULL.md` §4.10) if the renderer is slow.
    async fn wait_for_ready(&self, node_id: NodeId, lease: &RendererLease) -> EngineResult<()> {
        let renderer = lease.renderer()?.clone();
        if renderer.state().await == RendererState::Ready
            || renderer.state().await == RendererState::Playing
        {
            return Ok(());
        }

        let soft_warn = Duration::from_millis(self.config.renderer_ready_soft_warn_ms);
        let mut subscription = renderer.subscribe();

        let result = tokio::time::timeout(soft_warn, async {
            loop {
                match subscription.recv().await {
                    Some(event) => {
                        if matches!(
                            event.as_ref(),
                            RendererEvent::StateChanged(RendererState::Ready)
                                | RendererEvent::StateChanged(RendererState::Playing)
                        ) {
                            return;
                        }
                    }
                    None => return,
                }
            }
        })
        .await;

        if result.is_err() {
            warn!(
                "Renderer for node {} did not become ready within {:?}",
                node_id, soft_warn
            );
            self.callbacks
                .invoke(PlaybackEngineEvent::RendererSlowToLoad(node_id));

            loop {
                match subscription.recv().await {
                    Some(event) => {
                        if matches!(
                            event.as_ref(),
                            RendererEvent::StateChanged(RendererState::Ready)
                                | RendererEvent::StateChanged(RendererState::Playing)
                        ) {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// `spec.md` §4.6 "Starting a node": map `Finished`/`Stalled`/`Error`,
    /// install one-shot child starters, and forward this node's own events
    /// onto the dispatch loop.
    async fn install_listener_group(&self, node_id: NodeId, lease: &RendererLease) -> EngineResult<()> {
        let renderer = lease.renderer()?.clone();
        let mut subscription = renderer.subscribe();
        let tx = self.message_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if tx.send(EngineMessage::Renderer(node_id, (*event).clone())).is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn install_child_starters(&self, node_id: NodeId, lease: &RendererLease) -> EngineResult<()> {
        let children = {
            let state = self.state.lock().await;
            state
                .tree
                .get(node_id)
                .map(|node| node.concurrent_children().to_vec())
                .unwrap_or_default()
        };

        for child in children {
            self.schedule_concurrent_starter(node_id, child, lease).await;
        }

        Ok(())
    }

    /// Register a one-shot `onceProgress(child.offset)` starter for a single
    /// Concurrent `child` of `parent`, using `parent`'s already-acquired
    /// lease. Called both while installing the full group at `startNode`
    /// time and whenever a Concurrent child is spliced onto a parent that is
    /// already Playing (`spec.md` §4.2 "subscribes to ChildAdded/ChildRemoved
    /// ... to install/remove such starters dynamically").
    async fn schedule_concurrent_starter(&self, parent: NodeId, child: NodeId, lease: &RendererLease) {
        let (offset, status) = {
            let state = self.state.lock().await;
            match state.tree.get(child) {
                Some(node) => (node.offset, node.status),
                None => return,
            }
        };
        let offset = match offset {
            Some(offset) => offset,
            None => return,
        };
        if status != NodeStatus::Queued {
            return;
        }

        let renderer = match lease.renderer() {
            Ok(renderer) => renderer,
            Err(_) => return,
        };

        let tx = self.message_tx.clone();
        match renderer
            .once_progress(
                offset,
                Box::new(move || {
                    let _ = tx.send(EngineMessage::ChildStart(parent, child));
                }),
            )
            .await
        {
            Ok(listener) => self.track_listener(parent, listener).await,
            Err(err) => warn!(
                "Could not schedule concurrent child {} of node {}: {}",
                child, parent, err
            ),
        }
    }

    async fn handle_child_start(&self, parent: NodeId, child: NodeId) {
        let (child_status, parent_layer) = {
            let state = self.state.lock().await;
            let status = state.tree.get(child).map(|node| node.status);
            let layer = state.node_layer.get(&parent).copied().unwrap_or(0);
            (status, layer)
        };

        match child_status {
            Some(NodeStatus::Queued) => {
                if let Err(err) = self.start_node(child, parent_layer + 1).await {
                    error!("Failed to start concurrent child {}: {}", child, err);
                }
            }
            _ => trace!("Ignoring stale child-start trigger for node {}", child),
        }
    }

    async fn complete_transition_in(&self, node_id: NodeId) {
        let status = {
            let state = self.state.lock().await;
            state.tree.status(node_id)
        };

        if status == Some(NodeStatus::TransitioningIn) {
            self.set_status(node_id, NodeStatus::Playing).await;
        }
    }

    // ---------------------------------------------------------------
    // Finishing a node (`spec.md` §4.6 "Finishing a node")
    // ---------------------------------------------------------------

    async fn on_node_finished(&self, node_id: NodeId) {
        let (queued_concurrent_unreached, queued_sequenced, transition_out_ms) = {
            let mut state = self.state.lock().await;
            let node = match state.tree.get(node_id) {
                Some(node) => node,
                None => return,
            };
            let sequenced = node.sequenced_child();
            let concurrent: Vec<NodeId> = node
                .concurrent_children()
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .tree
                        .get(*id)
                        .map(|child| child.status == NodeStatus::Queued)
                        .unwrap_or(false)
                })
                .collect();
            let transition_out_ms = node.block.transition_out_ms;

            for child in &concurrent {
                warn!(
                    "Node {} finished with unreached concurrent child {}; detaching it",
                    node_id, child
                );
                let _ = state.tree.detach(*child);
            }

            (concurrent, sequenced, transition_out_ms)
        };
        let _ = queued_concurrent_unreached;

        if let Some(child) = queued_sequenced {
            let layer = {
                let state = self.state.lock().await;
                state.node_layer.get(&node_id).copied().unwrap_or(0)
            };
            if let Err(err) = self.start_node(child, layer).await {
                error!("Failed to start sequenced successor {}: {}", child, err);
            }
        }

        if transition_out_ms == 0 {
            self.finalize_stop(node_id).await;
        } else {
            self.set_status(node_id, NodeStatus::TransitioningOut).await;
            if let Some(lease) = self.node_lease(node_id).await {
                if let Ok(renderer) = lease.renderer() {
                    renderer.stop_and_unload().await;
                }
            }

            let tx = self.message_tx.clone();
            let timeout =
                Duration::from_millis(transition_out_ms + self.config.transition_out_finalize_grace_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(EngineMessage::FinalizeStop(node_id));
            });
        }
    }

    async fn on_renderer_idle(&self, node_id: NodeId) {
        let status = {
            let state = self.state.lock().await;
            state.tree.status(node_id)
        };

        if status == Some(NodeStatus::TransitioningOut) {
            self.finalize_stop(node_id).await;
        }
    }

    /// A renderer entering `Error` is treated as a premature `Finished`
    /// (`spec.md` §7 "Propagation policy"), except for the default block,
    /// whose failure triggers the retry/backoff path instead.
    async fn on_node_error(&self, node_id: NodeId) {
        let is_default_root = {
            let state = self.state.lock().await;
            state.tree.root() == Some(node_id)
                && state
                    .tree
                    .get(node_id)
                    .map(|node| node.block.id == self.default_block.id)
                    .unwrap_or(false)
        };

        warn!("Renderer for node {} entered Error state", node_id);

        if is_default_root {
            self.finalize_stop(node_id).await;
            self.schedule_default_retry().await;
        } else {
            self.on_node_finished(node_id).await;
        }
    }

    /// Stop, detach and dispose of `node_id`: the terminal step of both the
    /// zero-transition-out fast path and the transition-out finalize path.
    async fn finalize_stop(&self, node_id: NodeId) {
        let status = {
            let state = self.state.lock().await;
            state.tree.status(node_id)
        };
        if status.is_none() {
            return;
        }

        self.cancel_node_listeners(node_id).await;

        {
            let mut state = self.state.lock().await;
            state.hierarchy.remove(node_id);
            state.front.remove(&node_id);
            state.node_layer.remove(&node_id);
        }

        let lease = self.node_lease(node_id).await;
        if let Some(lease) = &lease {
            if let Ok(renderer) = lease.renderer() {
                renderer.stop_and_unload().await;
            }
            lease.release();
        }

        let (removed, temperamental, orphans) = {
            let mut state = self.state.lock().await;
            match state.tree.remove_and_promote(node_id) {
                Ok((node, orphans)) => (true, node.temperamental, orphans),
                Err(_) => (false, false, Vec::new()),
            }
        };
        let _ = temperamental;

        for orphan in orphans {
            warn!(
                "Node {} was removed while concurrent child {} was still active; finalizing it too",
                node_id, orphan
            );
            Box::pin(self.finalize_stop(orphan)).await;
        }

        if removed {
            trace!("Node {} reached terminal status {}", node_id, NodeStatus::Finished);
            self.ensure_front_not_empty().await;
            self.callbacks.invoke(PlaybackEngineEvent::ActiveBlocksChanged);
        }
    }

    async fn ensure_front_not_empty(&self) {
        let needs_default = {
            let state = self.state.lock().await;
            state.tree.root().is_none()
        };

        if needs_default {
            self.startup().await;
        }
    }

    // ---------------------------------------------------------------
    // Queue mutation operations (`spec.md` §4.6 "Public queue operations")
    // ---------------------------------------------------------------

    pub(crate) async fn enqueue(&self, block: ContentBlock) -> NodeId {
        let target = {
            let state = self.state.lock().await;
            state
                .tree
                .root()
                .map(|root| *state.tree.primary_path(root).last().unwrap())
        };

        let node_id = match target {
            Some(target) => self
                .enqueue_relative(block, target, StartType::Sequenced, None)
                .await
                .expect("appending at the tail of the primary path never fails"),
            None => {
                let node_id = fx_handle::Handle::new();
                let node = PlaybackNode::new(node_id, block, StartType::Sequenced, None);
                let mut state = self.state.lock().await;
                state.tree.set_root(node);
                node_id
            }
        };

        self.after_queue_mutation().await;
        node_id
    }

    pub(crate) async fn enqueue_relative(
        &self,
        block: ContentBlock,
        target: NodeId,
        start_type: StartType,
        offset: Option<PlaybackOffset>,
    ) -> EngineResult<NodeId> {
        let mut state = self.state.lock().await;

        if !state.tree.contains(target) {
            return Err(EngineError::UnknownNode(target));
        }

        let node_id = fx_handle::Handle::new();
        let node = PlaybackNode::new(node_id, block, start_type, None);

        let target_lease = match start_type {
            StartType::Sequenced => {
                // Splices `node` between `target` and its current Sequenced
                // child; `target` itself keeps whatever status it already
                // has, so this never displaces an active node.
                state.tree.insert_sequenced(target, node)?;
                None
            }
            StartType::Concurrent => {
                let offset = offset.ok_or_else(|| {
                    EngineError::InvalidType("Concurrent start requires an offset".to_string())
                })?;

                // §4.6 "Tie-breaks & ordering": offsets evaluated against
                // infinite media are rejected at enqueue time, not deferred
                // to when the child would have started.
                let target_duration = state
                    .tree
                    .get(target)
                    .map(|node| node.block.media.duration)
                    .ok_or(EngineError::UnknownNode(target))?;
                offset.evaluate(target_duration)?;

                state.tree.insert_concurrent(target, node, offset)?;

                // The target may already be Playing, in which case
                // `startNode` already ran its child-starter installation
                // pass and will never see this new child; schedule it now.
                match state.tree.status(target) {
                    Some(status) if status != NodeStatus::Queued => {
                        state.tree.get(target).and_then(|node| node.renderer.clone())
                    }
                    _ => None,
                }
            }
        };

        drop(state);

        if let Some(lease) = target_lease {
            self.schedule_concurrent_starter(target, node_id, &lease).await;
        }

        self.after_queue_mutation().await;
        Ok(node_id)
    }

    pub(crate) async fn dequeue(&self, node_id: NodeId) -> EngineResult<()> {
        let released_leases = {
            let mut state = self.state.lock().await;
            let status = state
                .tree
                .status(node_id)
                .ok_or(EngineError::UnknownNode(node_id))?;
            if status != NodeStatus::Queued {
                return Err(EngineError::ModifyingActiveNode(node_id));
            }

            let (_, orphans) = state.tree.remove_and_promote(node_id)?;

            // `node_id` was Queued, so its Concurrent children never started
            // and are themselves still Queued; purge them (and anything
            // they in turn carry) from the arena rather than leaving them
            // unparented, and release any preloaded lease they hold.
            let mut purged = vec![node_id];
            for orphan in orphans {
                purged.extend(state.tree.remove_subtree(orphan));
            }

            purged
                .into_iter()
                .filter_map(|id| state.preloaded.remove(&id))
                .collect::<Vec<_>>()
        };

        for lease in released_leases {
            lease.release();
        }

        self.after_queue_mutation().await;
        Ok(())
    }

    pub(crate) async fn update(&self, node_id: NodeId, new_block: ContentBlock) -> EngineResult<()> {
        let released_lease = {
            let mut state = self.state.lock().await;
            let status = state
                .tree
                .status(node_id)
                .ok_or(EngineError::UnknownNode(node_id))?;
            if status != NodeStatus::Queued {
                return Err(EngineError::ModifyingActiveNode(node_id));
            }

            let unchanged = state
                .tree
                .get(node_id)
                .map(|node| node.block == new_block)
                .unwrap_or(false);
            if unchanged {
                return Ok(());
            }

            if let Some(node) = state.tree.get_mut(node_id) {
                node.block = new_block;
            }
            state.preloaded.remove(&node_id)
        };

        if let Some(lease) = released_lease {
            lease.release();
        }

        self.after_queue_mutation().await;
        Ok(())
    }

    pub(crate) async fn reorder(
        &self,
        source: NodeId,
        destination: NodeId,
        place_before: bool,
    ) -> EngineResult<()> {
        {
            let mut state = self.state.lock().await;
            let source_status = state
                .tree
                .status(source)
                .ok_or(EngineError::UnknownNode(source))?;
            if source_status != NodeStatus::Queued {
                return Err(EngineError::ModifyingActiveNode(source));
            }
            if !state.tree.contains(destination) {
                return Err(EngineError::UnknownNode(destination));
            }

            state.tree.detach(source)?;
            if place_before {
                let destination_parent = state
                    .tree
                    .get(destination)
                    .and_then(|node| node.parent)
                    .ok_or(EngineError::UnknownNode(destination))?;
                // `insert_sequenced` inherits the parent's current Sequenced
                // child (still `destination`) as the spliced node's own
                // child, so this alone places `source` directly before it.
                state.tree.reattach_sequenced(destination_parent, source)?;
            } else {
                state.tree.reattach_sequenced(destination, source)?;
            }
        }

        self.after_queue_mutation().await;
        Ok(())
    }

    /// `spec.md` §4.6 "skip": treat the primary-front node as `Finished`
    /// immediately. If it has already reached `TransitioningOut` (its
    /// sequenced successor, if any, was already started when it naturally
    /// entered that state), re-running the full finished-handling pipeline
    /// would start that successor a second time; skip instead just
    /// finalizes the pending stop immediately, without waiting out the
    /// remaining `transitionOutMs` (`spec.md` §8 scenario S6).
    pub(crate) async fn skip(&self) -> EngineResult<()> {
        let (front_node, status) = {
            let state = self.state.lock().await;
            let root = state.tree.root().ok_or(EngineError::AlreadyStopped)?;
            (root, state.tree.status(root))
        };

        if status == Some(NodeStatus::TransitioningOut) {
            self.finalize_stop(front_node).await;
        } else {
            self.on_node_finished(front_node).await;
        }
        Ok(())
    }

    pub(crate) async fn restart(&self) -> EngineResult<()> {
        let front_node = {
            let state = self.state.lock().await;
            state.tree.root().ok_or(EngineError::AlreadyStopped)?
        };

        if let Some(lease) = self.node_lease(front_node).await {
            lease.renderer()?.restart().await;
        }
        self.set_status(front_node, NodeStatus::Playing).await;
        Ok(())
    }

    pub(crate) async fn stop_to_default(&self) -> EngineResult<()> {
        let root = {
            let state = self.state.lock().await;
            state.tree.root().ok_or(EngineError::AlreadyStopped)?
        };

        let already_default = {
            let state = self.state.lock().await;
            state
                .tree
                .get(root)
                .map(|node| node.block.id == self.default_block.id)
                .unwrap_or(false)
        };
        if already_default {
            return Err(EngineError::AlreadyStopped);
        }

        let default_transition_in = self.default_block.transition_in_ms;
        let default_node_id = fx_handle::Handle::new();

        {
            let mut state = self.state.lock().await;
            if let Some(node) = state.tree.get(root) {
                for child in node.concurrent_children().to_vec() {
                    let _ = state.tree.detach(child);
                }
            }

            let default_node =
                PlaybackNode::new(default_node_id, self.default_block.clone(), StartType::Sequenced, None);
            state.tree.insert_sequenced(root, default_node)?;

            if let Some(node) = state.tree.get_mut(root) {
                node.block.transition_out_ms = default_transition_in;
            }
        }

        self.on_node_finished(root).await;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Temp-node providers (`spec.md` §4.7)
    // ---------------------------------------------------------------

    pub(crate) async fn register_temp_provider(
        &self,
        priority: i32,
        provider: Arc<dyn TempNodeProvider>,
    ) -> ProviderId {
        let id = {
            let mut state = self.state.lock().await;
            state.temp_providers.register(priority, provider)
        };
        self.reevaluate_temp_nodes().await;
        id
    }

    pub(crate) async fn remove_temp_provider(&self, id: ProviderId) {
        {
            let mut state = self.state.lock().await;
            let nodes = state.temp_providers.unregister(id);
            for node in nodes {
                let _ = state.tree.detach(node);
            }
        }
        self.reevaluate_temp_nodes().await;
    }

    async fn after_queue_mutation(&self) {
        self.callbacks.invoke(PlaybackEngineEvent::PlayQueueChanged);
        self.reevaluate_temp_nodes().await;
        self.preload_policy().await;
    }

    async fn reevaluate_temp_nodes(&self) {
        let mut state = self.state.lock().await;
        if state.temp_providers.is_reevaluating() {
            return;
        }

        let stale = state.temp_providers.clear_all();
        for node in stale {
            if let Some(status) = state.tree.status(node) {
                if status == NodeStatus::Queued {
                    if let Ok((_, orphans)) = state.tree.remove_and_promote(node) {
                        for orphan in orphans {
                            state.tree.remove_subtree(orphan);
                        }
                    }
                }
            }
        }

        let queue = state
            .tree
            .root()
            .map(|root| {
                state
                    .tree
                    .primary_path(root)
                    .into_iter()
                    .filter_map(|id| state.tree.get(id).map(|node| node.block.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let outputs = state.temp_providers.poll_all(&queue);

        for (provider_id, outputs) in outputs {
            for output in outputs {
                let target_id = match &output.relative_target {
                    crate::core::temp_provider::RelativeTarget::BlockId(block_id) => state
                        .tree
                        .root()
                        .map(|root| state.tree.primary_path(root))
                        .unwrap_or_default()
                        .into_iter()
                        .find(|id| {
                            state
                                .tree
                                .get(*id)
                                .map(|node| &node.block.id == block_id)
                                .unwrap_or(false)
                        }),
                };

                let target_id = match target_id {
                    Some(id) => id,
                    None => continue,
                };

                let node_id = fx_handle::Handle::new();
                let mut node = PlaybackNode::new(node_id, output.block, output.start_relationship, None);
                node.temperamental = true;

                let result = match output.start_relationship {
                    StartType::Sequenced => state.tree.insert_sequenced(target_id, node),
                    StartType::Concurrent => {
                        if let Some(offset) = output.offset {
                            node.offset = Some(offset);
                            state.tree.insert_concurrent(target_id, node, offset)
                        } else {
                            continue;
                        }
                    }
                };

                if result.is_ok() {
                    state.temp_providers.record_contribution(provider_id, node_id);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Preloading (`spec.md` §4.6 "Preload policy")
    // ---------------------------------------------------------------

    async fn preload_policy(&self) {
        let (candidates, current_kind, currently_transitioning_out) = {
            let state = self.state.lock().await;
            let root = match state.tree.root() {
                Some(root) => root,
                None => return,
            };
            let current_kind = state.tree.get(root).map(|node| node.block.media.kind);
            let transitioning_out = state.tree.status(root) == Some(NodeStatus::TransitioningOut);

            let path = state.tree.primary_path(root);
            let candidates: Vec<(NodeId, MediaKind)> = path
                .into_iter()
                .skip(1)
                .filter(|id| state.tree.status(*id) == Some(NodeStatus::Queued))
                .take(self.config.preload_depth)
                .filter_map(|id| state.tree.get(id).map(|node| (id, node.block.media.kind)))
                .collect();

            (candidates, current_kind, transitioning_out)
        };

        for (node_id, kind) in candidates {
            let same_type_as_current = current_kind == Some(kind);
            if same_type_as_current
                && !currently_transitioning_out
                && self.config.same_type_preload_defer
            {
                continue;
            }

            let already_preloaded = {
                let state = self.state.lock().await;
                state.preloaded.contains_key(&node_id)
            };
            if already_preloaded {
                continue;
            }

            let lease = match self.pool.acquire(kind) {
                Ok(lease) => lease,
                Err(err) => {
                    trace!("Skipping preload of node {}: {}", node_id, err);
                    continue;
                }
            };

            let media = {
                let state = self.state.lock().await;
                state.tree.get(node_id).map(|node| node.block.media.clone())
            };
            if let Some(media) = media {
                if let Ok(renderer) = lease.renderer() {
                    renderer.load_media(media).await;
                }
            }

            let mut state = self.state.lock().await;
            state.preloaded.insert(node_id, lease);
        }
    }

    // ---------------------------------------------------------------
    // Snapshots (`spec.md` §6.3)
    // ---------------------------------------------------------------

    pub(crate) async fn queue_snapshot(&self) -> Vec<crate::core::engine::events::QueueEntrySnapshot> {
        let state = self.state.lock().await;
        match state.tree.root() {
            Some(root) => state
                .tree
                .primary_path(root)
                .into_iter()
                .filter_map(|id| state.tree.get(id).map(|node| queue_entry_snapshot(id, &node.block)))
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) async fn active_snapshot(&self) -> Vec<ActiveEntrySnapshot> {
        let (front, node_layer) = {
            let state = self.state.lock().await;
            (state.front.clone(), state.node_layer.clone())
        };

        let mut entries = Vec::new();
        for node_id in front {
            let (block, status, lease) = {
                let state = self.state.lock().await;
                match state.tree.get(node_id) {
                    Some(node) => (node.block.clone(), node.status, node.renderer.clone()),
                    None => continue,
                }
            };

            let progress_ms = match &lease {
                Some(lease) => match lease.renderer() {
                    Ok(renderer) => {
                        let raw = renderer.current_progress_ms().await;
                        match block.media.duration.millis() {
                            Some(duration_ms) => raw.min(duration_ms),
                            None => raw,
                        }
                    }
                    Err(_) => 0,
                },
                None => 0,
            };

            entries.push(ActiveEntrySnapshot {
                entry: queue_entry_snapshot(node_id, &block),
                progress_ms,
                status,
                layer_index: node_layer.get(&node_id).copied().unwrap_or(0),
            });
        }

        entries
    }

    // ---------------------------------------------------------------
    // Small shared helpers
    // ---------------------------------------------------------------

    async fn set_status(&self, node_id: NodeId, status: NodeStatus) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.tree.get_mut(node_id) {
            node.set_status(status);
        }
    }

    async fn node_lease(&self, node_id: NodeId) -> Option<RendererLease> {
        let state = self.state.lock().await;
        state.tree.get(node_id).and_then(|node| node.renderer.clone())
    }

    async fn track_listener(&self, node_id: NodeId, listener: ListenerId) {
        let mut state = self.state.lock().await;
        state.node_listeners.entry(node_id).or_default().push(listener);
    }

    async fn cancel_node_listeners(&self, node_id: NodeId) {
        let (listeners, lease) = {
            let mut state = self.state.lock().await;
            let listeners = state.node_listeners.remove(&node_id).unwrap_or_default();
            let lease = state.tree.get(node_id).and_then(|node| node.renderer.clone());
            (listeners, lease)
        };

        if let Some(lease) = lease {
            if let Ok(renderer) = lease.renderer() {
                for listener in listeners {
                    renderer.off(listener).await;
                }
            }
        }
    }
}
