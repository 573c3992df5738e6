//! Typed views of the provider's API responses.
//!
//! These are the shapes the rest of the application works with; the raw
//! wire structs live next to the transport in `api.rs`.

use serde::{Deserialize, Serialize};

/// Display metadata for a single track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// Canonical provider URI (`spotify:track:<id>`).
    pub uri: String,
    pub name: String,
    /// All artists, comma-joined.
    pub artist: String,
    pub album: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Metadata for a playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner: String,
    pub track_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// One poll of the conductor's real playback.
///
/// `uri` is `None` when nothing is playing, or when the player is on a
/// local file or private session the API will not identify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub uri: Option<String>,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
}

impl PlaybackSnapshot {
    /// A snapshot representing "nothing observable is playing".
    #[must_use]
    pub fn idle() -> Self {
        Self {
            uri: None,
            progress_ms: 0,
            duration_ms: 0,
            is_playing: false,
        }
    }
}

/// Result of a token grant (authorization code or refresh).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the access token expires.
    pub expires_in: u64,
    /// The provider may rotate the refresh token; absent means keep the old one.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The authenticated account behind an access token.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub display_name: String,
    pub email: String,
}
