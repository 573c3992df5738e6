//! Room history records.

use serde::{Deserialize, Serialize};

use super::track::Track;
use crate::utils::now_millis;

/// The kinds of events the history ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    TrackAdded,
    TrackPlay,
    TrackSkip,
    FallbackPlay,
    Jam,
    Unjam,
    Airhorn,
    Message,
    UserConnected,
    UserDisconnected,
}

/// Compact track reference embedded in history events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub uri: String,
    pub name: String,
    pub artist: String,
}

impl From<&Track> for TrackSummary {
    fn from(track: &Track) -> Self {
        Self {
            uri: track.uri.clone(),
            name: track.name.clone(),
            artist: track.artist.clone(),
        }
    }
}

/// One entry in the append-only history ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub kind: HistoryKind,
    pub timestamp: u64,
    /// Actor display name.
    pub name: String,
    /// Actor email; empty for system-originated events.
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HistoryEvent {
    /// An event about a track, attributed to an actor.
    #[must_use]
    pub fn for_track(kind: HistoryKind, name: &str, email: &str, track: &Track) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            name: name.to_string(),
            email: email.to_string(),
            track: Some(track.into()),
            message: None,
        }
    }

    /// An actor-only event (airhorn, connect, disconnect).
    #[must_use]
    pub fn for_actor(kind: HistoryKind, name: &str, email: &str) -> Self {
        Self {
            kind,
            timestamp: now_millis(),
            name: name.to_string(),
            email: email.to_string(),
            track: None,
            message: None,
        }
    }

    /// A chat message event.
    #[must_use]
    pub fn for_message(name: &str, email: &str, message: &str) -> Self {
        Self {
            kind: HistoryKind::Message,
            timestamp: now_millis(),
            name: name.to_string(),
            email: email.to_string(),
            track: None,
            message: Some(message.to_string()),
        }
    }
}

/// One completed play in the play-history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayedTrack {
    pub timestamp: u64,
    pub track: Track,
    /// Display name of the participant who started the play.
    pub started_by: String,
}
