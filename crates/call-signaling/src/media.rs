//! Local capture handles. The core never looks inside a track; it attaches
//! tracks to the negotiation engine and stops them on teardown.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    /// Lets an engine recover its own concrete track type.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaHandle, MediaError>;
}

/// A set of local tracks acquired together.
#[derive(Clone)]
pub struct MediaHandle {
    id: String,
    tracks: Vec<Arc<dyn LocalTrack>>,
    stopped: Arc<AtomicBool>,
}

impl MediaHandle {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// Stops every track. Only the first call has an effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        tracing::debug!(target = "media", handle = %self.id, tracks = self.tracks.len(), "local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field(
                "tracks",
                &self
                    .tracks
                    .iter()
                    .map(|track| (track.id().to_string(), track.kind()))
                    .collect::<Vec<_>>(),
            )
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Track with no capture behind it; useful for headless agents and tests.
#[derive(Debug)]
pub struct PlaceholderTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl PlaceholderTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{kind:?}-{}", Uuid::new_v4()).to_lowercase(),
            kind,
            stopped: AtomicBool::new(false),
        }
    }
}

impl LocalTrack for PlaceholderTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
