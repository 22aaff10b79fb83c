use derive_more::Display;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_ACTIVE_RENDERERS: fn() -> usize = || 32;
const DEFAULT_PRELOAD_DEPTH: fn() -> usize = || 3;
const DEFAULT_SAME_TYPE_PRELOAD_DEFER: fn() -> bool = || true;
const DEFAULT_TRANSITION_OUT_GRACE_MS: fn() -> u64 = || 1000;
const DEFAULT_RETRY_INITIAL_MS: fn() -> u64 = || 2000;
const DEFAULT_RETRY_MAX_MS: fn() -> u64 = || 10_000;
const DEFAULT_RENDERER_READY_SOFT_WARN_MS: fn() -> u64 = || 5000;

/// Tunable knobs of the [`crate::core::engine::PlaybackEngine`].
///
/// `spec.md` fixes most of these as defaults rather than invariants; a
/// hosting application may load a [`PlayoutConfig`] from its own persisted
/// settings and hand it to the engine at construction time. The engine
/// itself never persists this value.
#[derive(Debug, Display, Clone, Serialize, Deserialize, PartialEq)]
#[display(fmt = "max_active_renderers: {}, preload_depth: {}", max_active_renderers, preload_depth)]
pub struct PlayoutConfig {
    /// Maximum number of layers the render hierarchy accepts at once.
    #[serde(default = "DEFAULT_MAX_ACTIVE_RENDERERS")]
    pub max_active_renderers: usize,
    /// Number of upcoming primary-path queued nodes to preload.
    #[serde(default = "DEFAULT_PRELOAD_DEPTH")]
    pub preload_depth: usize,
    /// Whether preloading a node whose content type matches the currently
    /// playing primary renderer is deferred until that renderer enters
    /// `TransitioningOut`.
    #[serde(default = "DEFAULT_SAME_TYPE_PRELOAD_DEFER")]
    pub same_type_preload_defer: bool,
    /// Grace period added on top of `transitionOutMs` before a stop is
    /// force-finalized if the renderer never reaches `Idle`.
    #[serde(default = "DEFAULT_TRANSITION_OUT_GRACE_MS")]
    pub transition_out_finalize_grace_ms: u64,
    /// Initial backoff before retrying a failed default block.
    #[serde(default = "DEFAULT_RETRY_INITIAL_MS")]
    pub default_retry_initial_ms: u64,
    /// Backoff cap for retrying a failed default block.
    #[serde(default = "DEFAULT_RETRY_MAX_MS")]
    pub default_retry_max_ms: u64,
    /// How long to wait for a renderer to reach `Ready` before logging a
    /// soft warning (and emitting `RendererSlowToLoad`).
    #[serde(default = "DEFAULT_RENDERER_READY_SOFT_WARN_MS")]
    pub renderer_ready_soft_warn_ms: u64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            max_active_renderers: DEFAULT_MAX_ACTIVE_RENDERERS(),
            preload_depth: DEFAULT_PRELOAD_DEPTH(),
            same_type_preload_defer: DEFAULT_SAME_TYPE_PRELOAD_DEFER(),
            transition_out_finalize_grace_ms: DEFAULT_TRANSITION_OUT_GRACE_MS(),
            default_retry_initial_ms: DEFAULT_RETRY_INITIAL_MS(),
            default_retry_max_ms: DEFAULT_RETRY_MAX_MS(),
            renderer_ready_soft_warn_ms: DEFAULT_RENDERER_READY_SOFT_WARN_MS(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_playout_config_default() {
        let config = PlayoutConfig::default();

        assert_eq!(32, config.max_active_renderers);
        assert_eq!(3, config.preload_depth);
        assert!(config.same_type_preload_defer);
    }

    #[test]
    fn test_playout_config_serde_roundtrip() {
        let config = PlayoutConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let result: PlayoutConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config, result);
    }

    #[test]
    fn test_playout_config_defaults_from_partial_json() {
        let result: PlayoutConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(PlayoutConfig::default(), result);
    }
}
