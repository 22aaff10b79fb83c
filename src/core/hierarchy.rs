use crate::core::errors::{EngineError, EngineResult};
use crate::core::node::NodeId;
use crate::core::renderer::SourceHandle;

/// One entry in the compositor's Z-order: the node that owns the layer and
/// the opaque source handle its renderer exposed (`spec.md` §4.3, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub node: NodeId,
    pub source: SourceHandle,
}

/// The ordered stack of active renderer layers handed to the compositor.
/// Index 0 is the bottom of the stack.
///
/// Kept as a flat `Vec` rather than mirroring the playback tree's shape: the
/// hierarchy's ordering is compositor Z-order, which is unrelated to parent/
/// child relationships in [`crate::core::tree::PlaybackTree`] (`spec.md` §4.3).
#[derive(Debug, Default)]
pub struct RenderHierarchy {
    layers: Vec<Layer>,
    max_active_renderers: usize,
}

impl RenderHierarchy {
    pub fn new(max_active_renderers: usize) -> Self {
        Self {
            layers: Vec::new(),
            max_active_renderers,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.node == node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index_of(node).is_some()
    }

    /// Push a new layer to the top of the stack.
    pub fn insert(&mut self, node: NodeId, source: SourceHandle) -> EngineResult<()> {
        if self.layers.len() >= self.max_active_renderers {
            return Err(EngineError::HierarchyFull(self.max_active_renderers));
        }

        self.layers.push(Layer { node, source });
        Ok(())
    }

    /// Remove `node`'s layer, if present, preserving the relative order of
    /// the remaining layers.
    pub fn remove(&mut self, node: NodeId) -> Option<Layer> {
        let index = self.index_of(node)?;
        Some(self.layers.remove(index))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fx_handle::Handle;

    #[test]
    fn test_insert_and_index_of() {
        let mut hierarchy = RenderHierarchy::new(2);
        let node_a = Handle::new();
        let node_b = Handle::new();

        hierarchy.insert(node_a, Handle::new()).unwrap();
        hierarchy.insert(node_b, Handle::new()).unwrap();

        assert_eq!(Some(0), hierarchy.index_of(node_a));
        assert_eq!(Some(1), hierarchy.index_of(node_b));
    }

    #[test]
    fn test_insert_beyond_capacity_is_full() {
        let mut hierarchy = RenderHierarchy::new(1);
        hierarchy.insert(Handle::new(), Handle::new()).unwrap();

        let result = hierarchy.insert(Handle::new(), Handle::new());

        assert_eq!(Err(EngineError::HierarchyFull(1)), result);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut hierarchy = RenderHierarchy::new(3);
        let node_a = Handle::new();
        let node_b = Handle::new();
        let node_c = Handle::new();
        hierarchy.insert(node_a, Handle::new()).unwrap();
        hierarchy.insert(node_b, Handle::new()).unwrap();
        hierarchy.insert(node_c, Handle::new()).unwrap();

        hierarchy.remove(node_b);

        assert_eq!(Some(0), hierarchy.index_of(node_a));
        assert_eq!(Some(1), hierarchy.index_of(node_c));
        assert_eq!(2, hierarchy.len());
    }

    #[test]
    fn test_remove_unknown_node_is_none() {
        let mut hierarchy = RenderHierarchy::new(3);

        assert_eq!(None, hierarchy.remove(Handle::new()));
    }
}
