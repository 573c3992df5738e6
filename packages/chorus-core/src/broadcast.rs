//! Outbound message contracts and fan-out.
//!
//! Every state change a client can observe flows through one of these
//! message kinds; the payloads are the authoritative state. Delivery is a
//! non-blocking send into each session's outbound channel; the WebSocket
//! task drains it onto the wire.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{
    FollowMode, HistoryEvent, PlaybackMode, PlayedTrack, QueueEntry, SessionSummary, Track,
};
use crate::spotify::PlaylistInfo;

/// Sender half of a session's outbound channel.
pub type Outbox = mpsc::UnboundedSender<OutboundMessage>;

/// Creates a fresh outbound channel pair for a connecting transport.
#[must_use]
pub fn channel() -> (Outbox, mpsc::UnboundedReceiver<OutboundMessage>) {
    mpsc::unbounded_channel()
}

/// Messages sent to participants over the bidirectional channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// The display composition of the queue (user tier first, fallback pad).
    TracksList { tracks: Vec<QueueEntry> },

    /// Global playback state. Rendered per recipient because control
    /// eligibility differs between sessions.
    #[serde(rename_all = "camelCase")]
    Mode {
        mode: PlaybackMode,
        current_track: Option<Track>,
        conductor_id: Option<String>,
        can_take_master_control: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_playlist: Option<PlaylistInfo>,
    },

    /// The recipient's own follower mode.
    SessionMode { mode: FollowMode },

    /// Deduplicated participant directory.
    SessionsList { sessions: Vec<SessionSummary> },

    /// Most recent history events (bounded view of the ledger).
    History { events: Vec<HistoryEvent> },

    /// Most recent completed plays.
    PlayHistory { tracks: Vec<PlayedTrack> },

    PlayAirhorn { name: String },

    ProminentMessage { message: String },

    PlaybackError { message: String },

    /// Instructs a client-side player to align with the given track.
    PlayTrack { track: Track },

    #[serde(rename_all = "camelCase")]
    LoginSuccess { session_id: String },

    LoginError { message: String },

    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kinds_use_snake_case_tags() {
        let json = serde_json::to_value(OutboundMessage::TracksList { tracks: vec![] }).unwrap();
        assert_eq!(json["type"], "tracks_list");

        let json = serde_json::to_value(OutboundMessage::PlayHistory { tracks: vec![] }).unwrap();
        assert_eq!(json["type"], "play_history");

        let json = serde_json::to_value(OutboundMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");
    }

    #[test]
    fn mode_payload_uses_camel_case_fields() {
        let json = serde_json::to_value(OutboundMessage::Mode {
            mode: PlaybackMode::Playing,
            current_track: None,
            conductor_id: Some("s1".into()),
            can_take_master_control: true,
            fallback_playlist: None,
        })
        .unwrap();

        assert_eq!(json["type"], "mode");
        assert_eq!(json["mode"], "playing");
        assert_eq!(json["conductorId"], "s1");
        assert_eq!(json["canTakeMasterControl"], true);
        assert!(json.get("fallbackPlaylist").is_none());
    }

    #[test]
    fn login_messages_round_trip_session_id() {
        let json = serde_json::to_value(OutboundMessage::LoginSuccess {
            session_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "login_success");
        assert_eq!(json["sessionId"], "abc");
    }
}
