use crate::core::block::ContentBlock;
use crate::core::media::{LocationStatus, MediaObject};
use crate::core::node::{NodeId, NodeStatus};
use derive_more::Display;

/// Observable events published by a [`super::PlaybackEngine`]
/// (`spec.md` §4.6, §6.3; soft-warn telemetry is additive, see
/// `SPEC_FULL.md` §4.10).
#[derive(Debug, Display, Clone, PartialEq)]
pub enum PlaybackEngineEvent {
    /// The set of nodes occupying the render hierarchy changed.
    #[display(fmt = "active blocks changed")]
    ActiveBlocksChanged,
    /// The primary queue (ignoring temperamental nodes) changed shape.
    #[display(fmt = "play queue changed")]
    PlayQueueChanged,
    /// A renderer has not reached `Ready` within the configured soft-warn
    /// window while a node is waiting to start.
    #[display(fmt = "renderer for node {} is slow to become ready", _0)]
    RendererSlowToLoad(NodeId),
}

/// One row of a queue or active snapshot (`spec.md` §6.3).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntrySnapshot {
    pub queue_id: NodeId,
    pub id: String,
    pub media: MediaObject,
    pub colour: String,
    pub transition_in_ms: u64,
    pub transition_out_ms: u64,
    pub media_status: LocationStatus,
}

/// An active-set row: a [`QueueEntrySnapshot`] plus the fields only
/// meaningful while a node is on-screen.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEntrySnapshot {
    pub entry: QueueEntrySnapshot,
    pub progress_ms: u64,
    pub status: NodeStatus,
    pub layer_index: usize,
}

pub(crate) fn queue_entry_snapshot(node_id: NodeId, block: &ContentBlock) -> QueueEntrySnapshot {
    QueueEntrySnapshot {
        queue_id: node_id,
        id: block.id.clone(),
        media: block.media.clone(),
        colour: block.colour.clone(),
        transition_in_ms: block.transition_in_ms,
        transition_out_ms: block.transition_out_ms,
        media_status: block.media.location.status,
    }
}
