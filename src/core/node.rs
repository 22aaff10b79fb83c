use crate::core::block::{ContentBlock, PlaybackOffset};
use crate::core::pool::RendererLease;
use derive_more::Display;
use fx_handle::Handle;
use std::time::{SystemTime, UNIX_EPOCH};

/// The unique, engine-assigned identifier of a [`PlaybackNode`].
///
/// Modeled as a plain [`Handle`] rather than a pointer so that "cancel
/// everything for node X" and "detach every node contributed by provider P"
/// stay cheap id-keyed lookups under the arena model (`spec.md` §9).
pub type NodeId = Handle;

/// How a node's start is anchored relative to its parent.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum StartType {
    /// The node is the parent's primary successor; always child index 0.
    Sequenced,
    /// The node starts at a [`PlaybackOffset`] into the parent's playback.
    Concurrent,
}

/// The playback lifecycle of a node (`spec.md` §3 "Lifecycle").
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Queued,
    TransitioningIn,
    Playing,
    TransitioningOut,
    Finished,
}

impl NodeStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, NodeStatus::Finished)
    }
}

/// A tree-structured schedule entry: a [`ContentBlock`] placed relative to a
/// parent, tracking its own lifecycle and renderer lease (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct PlaybackNode {
    pub id: NodeId,
    pub block: ContentBlock,
    pub start_type: StartType,
    /// Required iff `start_type == Concurrent`.
    pub offset: Option<PlaybackOffset>,
    pub parent: Option<NodeId>,
    /// The sole Sequenced child, if any (`spec.md` §3 invariants).
    pub sequenced: Option<NodeId>,
    /// Every Concurrent child, in attachment order.
    pub concurrent: Vec<NodeId>,
    pub status: NodeStatus,
    /// Milliseconds since epoch at which `status` last changed.
    pub status_timestamp: u64,
    pub renderer: Option<RendererLease>,
    /// Set when this node was spliced in by a [`crate::core::temp_provider::TempNodeProviderRegistry`]
    /// provider rather than by an external mutation.
    pub temperamental: bool,
}

impl PlaybackNode {
    pub fn new(id: NodeId, block: ContentBlock, start_type: StartType, parent: Option<NodeId>) -> Self {
        Self {
            id,
            block,
            start_type,
            offset: None,
            parent,
            sequenced: None,
            concurrent: Vec::new(),
            status: NodeStatus::Queued,
            status_timestamp: now_millis(),
            renderer: None,
            temperamental: false,
        }
    }

    /// The sole Sequenced child, if any.
    pub fn sequenced_child(&self) -> Option<NodeId> {
        self.sequenced
    }

    /// All Concurrent children.
    pub fn concurrent_children(&self) -> &[NodeId] {
        &self.concurrent
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
        self.status_timestamp = now_millis();
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::media::{LocationStatus, MediaDuration, MediaKind, MediaLocation, MediaObject};

    fn block() -> ContentBlock {
        ContentBlock::new(
            "block-1",
            "red",
            MediaObject::new(
                "Foo",
                MediaKind::LocalFile,
                MediaLocation::new("/tmp/foo.mp4", LocationStatus::Ready),
                MediaDuration::Finite(1000),
            ),
        )
    }

    #[test]
    fn test_sequenced_and_concurrent_children() {
        let mut node = PlaybackNode::new(Handle::new(), block(), StartType::Sequenced, None);
        let seq_child = Handle::new();
        let concurrent_child = Handle::new();
        node.sequenced = Some(seq_child);
        node.concurrent.push(concurrent_child);

        assert_eq!(Some(seq_child), node.sequenced_child());
        assert_eq!(&[concurrent_child], node.concurrent_children());
    }

    #[test]
    fn test_set_status_updates_timestamp() {
        let mut node = PlaybackNode::new(Handle::new(), block(), StartType::Sequenced, None);
        let initial_timestamp = node.status_timestamp;

        std::thread::sleep(std::time::Duration::from_millis(5));
        node.set_status(NodeStatus::Playing);

        assert_eq!(NodeStatus::Playing, node.status);
        assert!(node.status_timestamp >= initial_timestamp);
    }
}
