use crate::core::errors::{EngineError, EngineResult};
use crate::core::media::{MediaDuration, MediaObject};
use derive_more::Display;

/// A schedulable item: a [`MediaObject`] wrapped with the playback
/// attributes the engine needs to sequence it (`spec.md` §3).
///
/// Logically immutable after creation: the engine never mutates a block in
/// place, it always replaces the whole value via `PlaybackEngine::update`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentBlock {
    pub id: String,
    pub colour: String,
    pub media: MediaObject,
    pub transition_in_ms: u64,
    pub transition_out_ms: u64,
}

impl ContentBlock {
    pub fn new(id: impl Into<String>, colour: impl Into<String>, media: MediaObject) -> Self {
        Self {
            id: id.into(),
            colour: colour.into(),
            media,
            transition_in_ms: 0,
            transition_out_ms: 0,
        }
    }

    pub fn with_transitions(mut self, transition_in_ms: u64, transition_out_ms: u64) -> Self {
        self.transition_in_ms = transition_in_ms;
        self.transition_out_ms = transition_out_ms;
        self
    }

    /// `transitionInMs + media.durationMs + transitionOutMs` (`spec.md` §3).
    /// Infinite media makes the effective duration infinite regardless of
    /// the transition lengths.
    pub fn effective_duration(&self) -> MediaDuration {
        match self.media.duration {
            MediaDuration::Infinite => MediaDuration::Infinite,
            MediaDuration::Finite(ms) => {
                MediaDuration::Finite(self.transition_in_ms + ms + self.transition_out_ms)
            }
        }
    }
}

/// A relative anchor for a concurrent child's start, evaluated against the
/// parent's media duration (`spec.md` §3).
#[derive(Debug, Display, Copy, Clone, PartialEq)]
pub enum PlaybackOffset {
    #[display(fmt = "{}ms after start", _0)]
    MsAfterStart(u64),
    #[display(fmt = "{}ms before end", _0)]
    MsBeforeEnd(u64),
    #[display(fmt = "{}% in", "_0 * 100.0")]
    Percentage(f64),
}

impl PlaybackOffset {
    /// Evaluate this offset against a known, finite parent duration,
    /// producing an absolute millisecond offset from the parent's start.
    ///
    /// Percentage values outside `[0,1]` are rejected; any offset evaluated
    /// against infinite media is rejected (`spec.md` §3, §4.6).
    pub fn evaluate(&self, duration: MediaDuration) -> EngineResult<u64> {
        match self {
            PlaybackOffset::Percentage(p) if !(0.0..=1.0).contains(p) => Err(
                EngineError::RangeError(format!("percentage offset {} outside [0,1]", p)),
            ),
            _ => {
                let duration_ms = duration.millis().ok_or_else(|| {
                    EngineError::RangeError(
                        "cannot evaluate a playback offset against infinite media".to_string(),
                    )
                })?;

                Ok(match self {
                    PlaybackOffset::MsAfterStart(ms) => (*ms).min(duration_ms),
                    PlaybackOffset::MsBeforeEnd(ms) => duration_ms.saturating_sub(*ms),
                    PlaybackOffset::Percentage(p) => (duration_ms as f64 * p).round() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::media::{LocationStatus, MediaKind, MediaLocation};

    fn media(duration: MediaDuration) -> MediaObject {
        MediaObject::new(
            "Foo",
            MediaKind::LocalFile,
            MediaLocation::new("/tmp/foo.mp4", LocationStatus::Ready),
            duration,
        )
    }

    #[test]
    fn test_effective_duration() {
        let block = ContentBlock::new("block-1", "red", media(MediaDuration::Finite(1000)))
            .with_transitions(200, 300);

        assert_eq!(
            MediaDuration::Finite(1500),
            block.effective_duration(),
            "expected the effective duration to include both transitions"
        );
    }

    #[test]
    fn test_effective_duration_infinite() {
        let block = ContentBlock::new("block-1", "red", media(MediaDuration::Infinite))
            .with_transitions(200, 300);

        assert_eq!(MediaDuration::Infinite, block.effective_duration());
    }

    #[test]
    fn test_offset_evaluate_ms_after_start() {
        let offset = PlaybackOffset::MsAfterStart(2000);

        let result = offset.evaluate(MediaDuration::Finite(5000)).unwrap();

        assert_eq!(2000, result);
    }

    #[test]
    fn test_offset_evaluate_ms_before_end() {
        let offset = PlaybackOffset::MsBeforeEnd(500);

        let result = offset.evaluate(MediaDuration::Finite(5000)).unwrap();

        assert_eq!(4500, result);
    }

    #[test]
    fn test_offset_evaluate_percentage() {
        let offset = PlaybackOffset::Percentage(0.5);

        let result = offset.evaluate(MediaDuration::Finite(4000)).unwrap();

        assert_eq!(2000, result);
    }

    #[test]
    fn test_offset_evaluate_percentage_against_infinite_is_rejected() {
        let offset = PlaybackOffset::Percentage(0.5);

        let result = offset.evaluate(MediaDuration::Infinite);

        assert_eq!(
            Err(EngineError::RangeError(
                "cannot evaluate a playback offset against infinite media".to_string()
            )),
            result
        );
    }

    #[test]
    fn test_offset_evaluate_percentage_out_of_range_is_rejected() {
        let offset = PlaybackOffset::Percentage(1.5);

        let result = offset.evaluate(MediaDuration::Finite(4000));

        assert!(result.is_err());
    }
}
