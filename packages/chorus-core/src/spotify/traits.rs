//! Trait abstraction over the provider's Web API.
//!
//! The room and reconciliation logic depend on this trait rather than on
//! the HTTP client, so tests can inject scripted players.

use async_trait::async_trait;

use super::api::SpotifyResult;
use super::types::{PlaybackSnapshot, PlaylistInfo, TokenGrant, TrackInfo, UserProfile};

/// The provider operations the room coordinator needs.
///
/// Every call takes the acting session's access token; the gateway holds
/// no credentials of its own.
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    /// Fetches display metadata for one track.
    async fn track_info(&self, token: &str, id: &str) -> SpotifyResult<TrackInfo>;

    /// Fetches playlist metadata.
    async fn playlist_info(&self, token: &str, id: &str) -> SpotifyResult<PlaylistInfo>;

    /// Fetches every track of a playlist, paginating as needed.
    async fn playlist_tracks(&self, token: &str, id: &str) -> SpotifyResult<Vec<TrackInfo>>;

    /// Starts playback of the given URIs on the account's active device.
    async fn play(&self, token: &str, uris: &[String], position_ms: Option<u64>)
        -> SpotifyResult<()>;

    /// Pauses playback on the account's active device.
    async fn pause(&self, token: &str) -> SpotifyResult<()>;

    /// Reads the account's current playback; `None` when nothing plays.
    async fn current_playback(&self, token: &str) -> SpotifyResult<Option<PlaybackSnapshot>>;

    /// Exchanges a refresh token for a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> SpotifyResult<TokenGrant>;

    /// Picks `count` tracks at random from the most-recently liked.
    async fn random_liked(&self, token: &str, count: usize) -> SpotifyResult<Vec<TrackInfo>>;

    /// Identifies the account behind a token.
    async fn me(&self, token: &str) -> SpotifyResult<UserProfile>;
}
