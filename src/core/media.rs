use derive_more::Display;

/// The kind of content a [`MediaObject`] points to.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A file addressable on local storage.
    LocalFile,
    /// A remote, HTTP(S)-addressable video stream.
    WebStream,
    /// A live RTMP ingest/stream.
    Rtmp,
    /// An HTML-based graphics overlay rendered by the graphics-package
    /// collaborator (see `spec.md` §1, out of scope here).
    GraphicsLayer,
}

/// The readiness of a [`MediaLocation`]'s backing address, as last observed
/// by the out-of-scope content-source collaborator.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LocationStatus {
    /// The address is confirmed reachable/playable.
    Ready,
    /// The address is still being resolved or warmed up.
    Pending,
    /// The address is known but currently unreachable.
    Offline,
    /// The address has not been checked yet.
    Untracked,
}

/// A content-type-tagged address of a [`MediaObject`].
#[derive(Debug, Display, Clone, PartialEq)]
#[display(fmt = "{}: {}", path, status)]
pub struct MediaLocation {
    pub path: String,
    pub status: LocationStatus,
}

impl MediaLocation {
    pub fn new(path: impl Into<String>, status: LocationStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }
}

/// The duration of a piece of media: either a known, finite length or
/// infinite (live streams, looping graphics layers).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum MediaDuration {
    #[display(fmt = "{}ms", _0)]
    Finite(u64),
    #[display(fmt = "infinite")]
    Infinite,
}

impl MediaDuration {
    pub fn is_infinite(&self) -> bool {
        matches!(self, MediaDuration::Infinite)
    }

    /// The finite duration in milliseconds, or `None` for infinite media.
    pub fn millis(&self) -> Option<u64> {
        match self {
            MediaDuration::Finite(ms) => Some(*ms),
            MediaDuration::Infinite => None,
        }
    }
}

/// An immutable description of a piece of media: kind, location, duration
/// and an optional thumbnail.
///
/// Two [`MediaObject`] instances are equal, and therefore interchangeable to
/// a renderer deciding whether to skip a redundant load, only when every
/// field matches (`spec.md` §4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct MediaObject {
    pub name: String,
    pub kind: MediaKind,
    pub location: MediaLocation,
    pub duration: MediaDuration,
    pub thumbnail: Option<Thumbnail>,
}

/// A thumbnail is either inline bytes or a URI pointing at one.
#[derive(Debug, Clone, PartialEq)]
pub enum Thumbnail {
    Bytes(Vec<u8>),
    Uri(String),
}

impl MediaObject {
    pub fn new(
        name: impl Into<String>,
        kind: MediaKind,
        location: MediaLocation,
        duration: MediaDuration,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            location,
            duration,
            thumbnail: None,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: Thumbnail) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }
}
