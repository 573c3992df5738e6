//! Domain model: tracks, participant sessions, history records.

pub mod history;
pub mod session;
pub mod track;

use serde::{Deserialize, Serialize};

pub use history::{HistoryEvent, HistoryKind, PlayedTrack, TrackSummary};
pub use session::{Credentials, FollowMode, PersistedSession, Session, SessionSummary};
pub use track::{QueueEntry, Track, TrackProgress, FALLBACK_EMAIL};

/// Global playback mode of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    Playing,
    #[default]
    Paused,
}
