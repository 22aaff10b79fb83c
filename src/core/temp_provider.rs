use crate::core::block::{ContentBlock, PlaybackOffset};
use crate::core::node::{NodeId, StartType};
use fx_handle::Handle;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// The identifier an engine assigns a registered [`TempNodeProvider`].
pub type ProviderId = Handle;

/// Where a provider's contributed block should be spliced relative to an
/// existing block in the primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelativeTarget {
    /// Splice relative to the block carrying this [`ContentBlock::id`].
    BlockId(String),
}

/// A single node a provider wants inserted on this evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub block: ContentBlock,
    pub relative_target: RelativeTarget,
    pub start_relationship: StartType,
    /// Required iff `start_relationship == Concurrent`.
    pub offset: Option<PlaybackOffset>,
}

/// A pluggable, pure function from the current primary queue to the
/// temperamental nodes it wants present (`spec.md` §4.7).
///
/// Implementations must be side-effect free: the engine may call `evaluate`
/// any number of times for the same queue state and must get back outputs
/// describing the same set of nodes at the same relative placements.
pub trait TempNodeProvider: Send + Sync + fmt::Debug {
    fn evaluate(&self, queue: &[ContentBlock]) -> Vec<ProviderOutput>;
}

struct Registration {
    id: ProviderId,
    priority: i32,
    provider: Arc<dyn TempNodeProvider>,
}

/// Holds registered [`TempNodeProvider`]s and the provider-id to contributed
/// node-id index the engine uses to clear and re-splice temperamental nodes
/// on every externally-triggered queue change.
///
/// This registry does not touch the playback tree itself; it is a pure
/// bookkeeping and polling component the engine drives, keeping tree
/// mutation serialized on the engine's own task (`spec.md` §5).
#[derive(Default)]
pub struct TempNodeProviderRegistry {
    registrations: Vec<Registration>,
    contributed: HashMap<ProviderId, HashSet<NodeId>>,
    reevaluating: bool,
}

impl TempNodeProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Providers with a higher `priority` are polled,
    /// and their outputs spliced, before lower-priority ones; ties are
    /// broken by registration order (`SPEC_FULL.md` §4.10).
    pub fn register(&mut self, priority: i32, provider: Arc<dyn TempNodeProvider>) -> ProviderId {
        let id = Handle::new();
        self.registrations.push(Registration {
            id,
            priority,
            provider,
        });
        self.contributed.insert(id, HashSet::new());
        id
    }

    pub fn unregister(&mut self, id: ProviderId) -> HashSet<NodeId> {
        self.registrations.retain(|reg| reg.id != id);
        self.contributed.remove(&id).unwrap_or_default()
    }

    pub fn is_reevaluating(&self) -> bool {
        self.reevaluating
    }

    /// Poll every registered provider against `queue`, in priority order,
    /// while the "reevaluating" flag is held. Callers must check
    /// [`Self::is_reevaluating`] before treating a `PlayQueueChanged` as an
    /// external trigger, so provider-caused insertions never recurse
    /// (`spec.md` §4.7).
    pub fn poll_all(&mut self, queue: &[ContentBlock]) -> Vec<(ProviderId, Vec<ProviderOutput>)> {
        self.reevaluating = true;

        let mut ordered: Vec<&Registration> = self.registrations.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let results = ordered
            .into_iter()
            .map(|reg| (reg.id, reg.provider.evaluate(queue)))
            .collect();

        self.reevaluating = false;
        results
    }

    /// Record that `provider` contributed `node` during the pass that
    /// just ran.
    pub fn record_contribution(&mut self, provider: ProviderId, node: NodeId) {
        self.contributed.entry(provider).or_default().insert(node);
    }

    /// All node ids contributed by any provider, across every provider's
    /// index, clearing the index in the process. The caller (the engine) is
    /// responsible for actually detaching/splicing these out of the tree.
    pub fn clear_all(&mut self) -> HashSet<NodeId> {
        let mut all = HashSet::new();
        for (_, nodes) in self.contributed.drain() {
            all.extend(nodes);
        }
        for reg in &self.registrations {
            self.contributed.insert(reg.id, HashSet::new());
        }
        all
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.registrations.iter().map(|reg| reg.id).collect()
    }
}

impl fmt::Debug for TempNodeProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempNodeProviderRegistry")
            .field("providers", &self.registrations.len())
            .field("reevaluating", &self.reevaluating)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::media::{LocationStatus, MediaDuration, MediaKind, MediaLocation, MediaObject};

    fn block(id: &str) -> ContentBlock {
        ContentBlock::new(
            id,
            "red",
            MediaObject::new(
                "Foo",
                MediaKind::LocalFile,
                MediaLocation::new("/tmp/foo.mp4", LocationStatus::Ready),
                MediaDuration::Finite(1000),
            ),
        )
    }

    #[derive(Debug)]
    struct StingerBeforeEvery2nd;

    impl TempNodeProvider for StingerBeforeEvery2nd {
        fn evaluate(&self, queue: &[ContentBlock]) -> Vec<ProviderOutput> {
            queue
                .iter()
                .enumerate()
                .filter(|(i, _)| i % 2 == 1)
                .map(|(_, b)| ProviderOutput {
                    block: block("stinger"),
                    relative_target: RelativeTarget::BlockId(b.id.clone()),
                    start_relationship: StartType::Sequenced,
                    offset: None,
                })
                .collect()
        }
    }

    #[test]
    fn test_poll_all_respects_priority_order() {
        let mut registry = TempNodeProviderRegistry::new();

        #[derive(Debug)]
        struct Tagged(i32);
        impl TempNodeProvider for Tagged {
            fn evaluate(&self, _queue: &[ContentBlock]) -> Vec<ProviderOutput> {
                vec![ProviderOutput {
                    block: block(&self.0.to_string()),
                    relative_target: RelativeTarget::BlockId("x".to_string()),
                    start_relationship: StartType::Sequenced,
                    offset: None,
                }]
            }
        }

        registry.register(0, Arc::new(Tagged(0)));
        registry.register(10, Arc::new(Tagged(10)));
        registry.register(5, Arc::new(Tagged(5)));

        let results = registry.poll_all(&[]);
        let priorities: Vec<&str> = results
            .iter()
            .map(|(_, outs)| outs[0].block.id.as_str())
            .collect();

        assert_eq!(vec!["10", "5", "0"], priorities);
        assert!(!registry.is_reevaluating());
    }

    #[test]
    fn test_idempotent_evaluation_yields_same_targets() {
        let mut registry = TempNodeProviderRegistry::new();
        registry.register(0, Arc::new(StingerBeforeEvery2nd));

        let queue = vec![block("x"), block("y"), block("z")];

        let first = registry.poll_all(&queue);
        let second = registry.poll_all(&queue);

        assert_eq!(first, second);
    }

    #[test]
    fn test_record_and_clear_contribution_index() {
        let mut registry = TempNodeProviderRegistry::new();
        let provider = registry.register(0, Arc::new(StingerBeforeEvery2nd));
        let node = Handle::new();

        registry.record_contribution(provider, node);
        let cleared = registry.clear_all();

        assert!(cleared.contains(&node));
        assert!(registry.clear_all().is_empty());
    }

    #[test]
    fn test_unregister_returns_contributed_nodes() {
        let mut registry = TempNodeProviderRegistry::new();
        let provider = registry.register(0, Arc::new(StingerBeforeEvery2nd));
        let node = Handle::new();
        registry.record_contribution(provider, node);

        let removed = registry.unregister(provider);

        assert!(removed.contains(&node));
        assert!(registry.provider_ids().is_empty());
    }
}
