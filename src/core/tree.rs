use crate::core::block::PlaybackOffset;
use crate::core::errors::{EngineError, EngineResult};
use crate::core::node::{NodeId, NodeStatus, PlaybackNode, StartType};
use std::collections::HashMap;

/// The arena owning every [`PlaybackNode`] reachable from the tree's single
/// root, keyed by [`NodeId`].
///
/// `spec.md` §9 calls out "recursive tree traversal via shared-mutable
/// parent pointers" as a pattern needing re-architecture: here parent and
/// child links are ids into this map, not pointers, so cancelling every
/// listener for a node or detaching every node a provider contributed is a
/// cheap, safe lookup under the engine's single-threaded ownership model.
///
/// `PlaybackNode`'s own `addChild`/`insertChildAt`/`removeChild`/
/// `removeChildAt` operations (`spec.md` §4.2) live here rather than on the
/// node itself, since only the tree can enforce the "at most one Sequenced
/// child, always at index 0" invariant across a mutation.
#[derive(Debug, Default)]
pub struct PlaybackTree {
    nodes: HashMap<NodeId, PlaybackNode>,
    root: Option<NodeId>,
}

impl PlaybackTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&PlaybackNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut PlaybackNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `node` as the tree's root. Panics if a root already exists;
    /// the engine is expected to always drain the tree down to nothing
    /// before installing a fresh root (startup, or after `stopToDefault`
    /// leaves nothing behind).
    pub fn set_root(&mut self, node: PlaybackNode) -> NodeId {
        assert!(self.root.is_none(), "a root node already exists");
        let id = node.id;
        self.nodes.insert(id, node);
        self.root = Some(id);
        id
    }

    /// Splice `node` in as `parent`'s Sequenced child (index 0). If
    /// `parent` already had a Sequenced child, that child becomes `node`'s
    /// own Sequenced child, preserving the remainder of the primary path.
    pub fn insert_sequenced(
        &mut self,
        parent: NodeId,
        mut node: PlaybackNode,
    ) -> EngineResult<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(EngineError::UnknownNode(parent));
        }

        let id = node.id;
        node.parent = Some(parent);
        node.start_type = StartType::Sequenced;

        let previous_child = self.nodes.get(&parent).unwrap().sequenced;
        if let Some(previous) = previous_child {
            if let Some(previous_node) = self.nodes.get_mut(&previous) {
                previous_node.parent = Some(id);
            }
            node.sequenced = Some(previous);
        }

        self.nodes.insert(id, node);
        self.nodes.get_mut(&parent).unwrap().sequenced = Some(id);

        Ok(id)
    }

    /// Append `node` as a Concurrent child of `parent` with the given
    /// offset.
    pub fn insert_concurrent(
        &mut self,
        parent: NodeId,
        mut node: PlaybackNode,
        offset: PlaybackOffset,
    ) -> EngineResult<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(EngineError::UnknownNode(parent));
        }

        let id = node.id;
        node.parent = Some(parent);
        node.start_type = StartType::Concurrent;
        node.offset = Some(offset);

        self.nodes.insert(id, node);
        self.nodes.get_mut(&parent).unwrap().concurrent.push(id);

        Ok(id)
    }

    /// Detach `id` from its parent's child list, clearing its own parent
    /// pointer. `id` stays in the arena, unparented, ready to be re-spliced
    /// elsewhere by `reattach_sequenced`/`reattach_concurrent`.
    ///
    /// If `id` occupied its parent's Sequenced slot, `id`'s own Sequenced
    /// child (if any) is promoted into that slot first, the same way
    /// `remove_and_promote` does for a permanent removal — otherwise `id`
    /// would carry its whole remaining primary-path tail along with it when
    /// re-spliced elsewhere, instead of leaving that tail behind in its
    /// original queue position.
    pub fn detach(&mut self, id: NodeId) -> EngineResult<()> {
        if !self.nodes.contains_key(&id) {
            return Err(EngineError::UnknownNode(id));
        }

        let parent = self.nodes.get(&id).unwrap().parent;
        let promoted = self.nodes.get(&id).unwrap().sequenced;

        match parent {
            Some(parent) => {
                let was_sequenced = self
                    .nodes
                    .get(&parent)
                    .map(|parent_node| parent_node.sequenced == Some(id))
                    .unwrap_or(false);

                if was_sequenced {
                    self.nodes.get_mut(&parent).unwrap().sequenced = promoted;
                    if let Some(promoted) = promoted {
                        if let Some(promoted_node) = self.nodes.get_mut(&promoted) {
                            promoted_node.parent = Some(parent);
                        }
                        self.nodes.get_mut(&id).unwrap().sequenced = None;
                    }
                } else if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.concurrent.retain(|child| *child != id);
                }
            }
            None => {
                if self.root == Some(id) {
                    self.root = promoted;
                    if let Some(promoted) = promoted {
                        if let Some(promoted_node) = self.nodes.get_mut(&promoted) {
                            promoted_node.parent = None;
                        }
                        self.nodes.get_mut(&id).unwrap().sequenced = None;
                    }
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = None;
        }

        Ok(())
    }

    /// Re-splice a previously detached node back in as `parent`'s Sequenced
    /// child, inheriting `parent`'s previous Sequenced child the same way
    /// `insert_sequenced` does.
    pub fn reattach_sequenced(&mut self, parent: NodeId, id: NodeId) -> EngineResult<()> {
        let node = self.remove_owned(id)?;
        self.insert_sequenced(parent, node)?;
        Ok(())
    }

    /// Fully remove `id` from the arena.
    ///
    /// If `id` occupied its parent's Sequenced slot (or was the tree root),
    /// its own Sequenced child, if any, is promoted into its place so the
    /// primary path stays connected. Any remaining Concurrent children are
    /// orphaned by this call and returned to the caller, who is expected to
    /// have already resolved them (per `spec.md` §4.6 "Finishing a node",
    /// step 2: detach-with-warning or start, before the parent is removed).
    pub fn remove_and_promote(&mut self, id: NodeId) -> EngineResult<(PlaybackNode, Vec<NodeId>)> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or(EngineError::UnknownNode(id))?;

        let promoted = node.sequenced_child();
        let orphans = node.concurrent_children().to_vec();

        match node.parent {
            Some(parent) => {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    let was_sequenced = parent_node.sequenced == Some(id);
                    if was_sequenced {
                        parent_node.sequenced = promoted;
                        if let Some(promoted) = promoted {
                            if let Some(promoted_node) = self.nodes.get_mut(&promoted) {
                                promoted_node.parent = Some(parent);
                            }
                        }
                    } else {
                        parent_node.concurrent.retain(|child| *child != id);
                    }
                }
            }
            None => {
                self.root = None;
                if let Some(promoted) = promoted {
                    if let Some(promoted_node) = self.nodes.get_mut(&promoted) {
                        promoted_node.parent = None;
                    }
                    self.root = Some(promoted);
                }
            }
        }

        for orphan in &orphans {
            if let Some(orphan_node) = self.nodes.get_mut(orphan) {
                orphan_node.parent = None;
            }
        }

        Ok((node, orphans))
    }

    /// Remove and return an already-detached (unparented) node, for
    /// internal re-splicing use.
    fn remove_owned(&mut self, id: NodeId) -> EngineResult<PlaybackNode> {
        self.nodes.remove(&id).ok_or(EngineError::UnknownNode(id))
    }

    /// Fully purge `id` and every node reachable from it (Sequenced and
    /// Concurrent descendants alike) from the arena, returning the ids
    /// removed. Does not unlink `id` from its own parent — callers that
    /// still need the parent's child-slot cleared (e.g. `dequeue`) must do
    /// that first, as `remove_and_promote`/`detach` already do.
    ///
    /// For subtrees that were never started (no renderer lease, not in the
    /// front), this is the cheap arena-only counterpart to the
    /// finalize/release sequence the engine runs for active nodes.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if let Some(sequenced) = node.sequenced {
                    stack.push(sequenced);
                }
                stack.extend(node.concurrent.iter().copied());
                removed.push(current);
            }
        }

        if self.root == Some(id) {
            self.root = None;
        }

        removed
    }

    /// The primary path starting at (and including) `from`, following
    /// Sequenced children until one has none.
    pub fn primary_path(&self, from: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(from);

        while let Some(id) = current {
            path.push(id);
            current = self.nodes.get(&id).and_then(|node| node.sequenced_child());
        }

        path
    }

    /// Every node id currently reachable from the root by following
    /// `sequenced`/`concurrent` links (`spec.md` §8 invariant 7).
    pub fn all_reachable_ids(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();

        while let Some(id) = stack.pop() {
            result.push(id);
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.sequenced.into_iter().chain(node.concurrent.iter().copied()));
            }
        }

        result
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.nodes.get(&id).map(|node| node.status)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::block::ContentBlock;
    use crate::core::media::{LocationStatus, MediaDuration, MediaKind, MediaLocation, MediaObject};
    use fx_handle::Handle;

    fn node(id: NodeId) -> PlaybackNode {
        let media = MediaObject::new(
            "Foo",
            MediaKind::LocalFile,
            MediaLocation::new("/tmp/foo.mp4", LocationStatus::Ready),
            MediaDuration::Finite(1000),
        );
        PlaybackNode::new(id, ContentBlock::new("block", "red", media), StartType::Sequenced, None)
    }

    #[test]
    fn test_set_root() {
        let mut tree = PlaybackTree::new();
        let id = Handle::new();

        let result = tree.set_root(node(id));

        assert_eq!(id, result);
        assert_eq!(Some(id), tree.root());
    }

    #[test]
    fn test_insert_sequenced_chain() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let child = Handle::new();

        tree.insert_sequenced(root, node(child)).unwrap();

        assert_eq!(vec![root, child], tree.primary_path(root));
        assert_eq!(Some(root), tree.get(child).unwrap().parent);
    }

    #[test]
    fn test_insert_sequenced_splices_between() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let b = Handle::new();
        tree.insert_sequenced(root, node(b)).unwrap();

        let a = Handle::new();
        tree.insert_sequenced(root, node(a)).unwrap();

        assert_eq!(vec![root, a, b], tree.primary_path(root));
    }

    #[test]
    fn test_insert_concurrent_child() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let overlay = Handle::new();

        tree.insert_concurrent(root, node(overlay), PlaybackOffset::MsAfterStart(2000))
            .unwrap();

        assert_eq!(&[overlay], tree.get(root).unwrap().concurrent_children());
    }

    #[test]
    fn test_remove_and_promote_sequenced_child() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let child = Handle::new();
        tree.insert_sequenced(root, node(child)).unwrap();

        let (removed, orphans) = tree.remove_and_promote(root).unwrap();

        assert_eq!(root, removed.id);
        assert!(orphans.is_empty());
        assert_eq!(Some(child), tree.root());
        assert_eq!(None, tree.get(child).unwrap().parent);
    }

    #[test]
    fn test_remove_and_promote_reports_concurrent_orphans() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let overlay = Handle::new();
        tree.insert_concurrent(root, node(overlay), PlaybackOffset::MsAfterStart(500))
            .unwrap();

        let (_removed, orphans) = tree.remove_and_promote(root).unwrap();

        assert_eq!(vec![overlay], orphans);
        assert!(tree.contains(overlay), "the orphan is left in the arena for the caller to dispose of");
    }

    #[test]
    fn test_remove_subtree_purges_descendants() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let overlay = Handle::new();
        let overlay_child = Handle::new();
        tree.insert_concurrent(root, node(overlay), PlaybackOffset::MsAfterStart(500))
            .unwrap();
        tree.insert_sequenced(overlay, node(overlay_child)).unwrap();

        let removed = tree.remove_subtree(overlay);

        assert_eq!(2, removed.len());
        assert!(removed.contains(&overlay));
        assert!(removed.contains(&overlay_child));
        assert!(!tree.contains(overlay));
        assert!(!tree.contains(overlay_child));
        assert_eq!(Some(root), tree.root(), "unrelated root is untouched");
    }

    #[test]
    fn test_detach_and_reattach_sequenced() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let a = Handle::new();
        let b = Handle::new();
        tree.insert_sequenced(root, node(a)).unwrap();
        tree.insert_sequenced(a, node(b)).unwrap();

        tree.detach(a).unwrap();
        assert_eq!(vec![root, b], tree.primary_path(root));

        tree.reattach_sequenced(root, a).unwrap();
        assert_eq!(vec![root, a, b], tree.primary_path(root));
    }

    #[test]
    fn test_all_reachable_ids() {
        let mut tree = PlaybackTree::new();
        let root = tree.set_root(node(Handle::new()));
        let seq = Handle::new();
        let overlay = Handle::new();
        tree.insert_sequenced(root, node(seq)).unwrap();
        tree.insert_concurrent(root, node(overlay), PlaybackOffset::MsAfterStart(100))
            .unwrap();

        let mut ids = tree.all_reachable_ids();
        ids.sort();
        let mut expected = vec![root, seq, overlay];
        expected.sort();

        assert_eq!(expected, ids);
    }

    #[test]
    fn test_unknown_node_error() {
        let mut tree = PlaybackTree::new();

        let result = tree.insert_sequenced(Handle::new(), node(Handle::new()));

        assert!(matches!(result, Err(EngineError::UnknownNode(_))));
    }
}
