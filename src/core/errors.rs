use crate::core::node::NodeId;
use thiserror::Error;

/// The result type returned by all fallible operations of this crate.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced synchronously to the caller of a [`crate::core::engine::PlaybackEngine`]
/// command. None of these mutate engine state before being returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// A node id referenced by a request is not present in the playback tree.
    #[error("node {0} is not known to the playback tree")]
    UnknownNode(NodeId),
    /// The request targets a node that is not [`crate::core::node::NodeStatus::Queued`].
    #[error("node {0} cannot be modified because it is no longer queued")]
    ModifyingActiveNode(NodeId),
    /// No renderer factory is registered for the requested content type.
    #[error("no renderer factory registered for content type {0:?}")]
    UnsupportedContentType(crate::core::media::MediaKind),
    /// Inserting a renderer would exceed `max_active_renderers`.
    #[error("render hierarchy is full ({0} layers)")]
    HierarchyFull(usize),
    /// The owning node of a failed renderer has been force-finished.
    #[error("renderer for node {0} failed")]
    RendererFailure(NodeId),
    /// An offset could not be evaluated against a duration (e.g. percentage against
    /// infinite media, percentage outside `[0,1]`, or a negative transition).
    #[error("invalid offset or transition value: {0}")]
    RangeError(String),
    /// A lease was used after `release()` had already been called on it.
    #[error("renderer lease has been revoked")]
    LeaseRevoked,
    /// The renderer pool has been shut down and can no longer hand out leases.
    #[error("renderer pool is closed")]
    PoolClosed,
    /// `stopToDefault` was requested while the default block was already the
    /// only thing playing.
    #[error("already showing the default block")]
    AlreadyStopped,
    /// A command carried a value of the wrong type (e.g. an offset type that
    /// does not apply to the given `startType`).
    #[error("invalid type: {0}")]
    InvalidType(String),
}
