mod engine;
mod events;
mod inner;

pub use engine::PlaybackEngine;
pub use events::{ActiveEntrySnapshot, PlaybackEngineEvent, QueueEntrySnapshot};
