//! Low-level REST transport for the provider's Web API.
//!
//! This module handles the raw HTTP calls, status-to-error mapping, and
//! wire-format parsing. For the typed client the rest of the application
//! uses, see `client.rs`.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use super::types::{PlaybackSnapshot, PlaylistInfo, TrackInfo, UserProfile};

/// Base URL for the Web API.
pub(crate) const API_BASE: &str = "https://api.spotify.com/v1";

/// Page size used when walking playlist and library pages.
const PAGE_LIMIT: usize = 100;

/// Maximum recent liked tracks considered by `random_liked`.
const LIKED_LIMIT: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur while talking to the provider.
#[derive(Debug, Error)]
pub enum SpotifyError {
    /// HTTP request failed before producing a status code.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A player command was issued but the account has no active device.
    #[error("no active playback device")]
    NoActiveDevice,

    /// The access token was rejected; a refresh may recover.
    #[error("access token rejected")]
    Unauthorized,

    /// The account may not access the resource.
    #[error("access forbidden")]
    Forbidden,

    /// The resource does not exist or is not readable.
    #[error("resource not found")]
    NotFound,

    /// Any other non-success status.
    #[error("provider API error {0}: {1}")]
    Api(u16, String),

    /// The response body did not match the expected shape.
    #[error("failed to parse provider response: {0}")]
    Parse(String),
}

/// Convenient Result alias for provider operations.
pub type SpotifyResult<T> = Result<T, SpotifyError>;

impl SpotifyError {
    /// Returns true if this error is transient and the operation may be
    /// retried (the reconciliation loop retries on its next tick).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            SpotifyError::Http(e) => e.is_timeout() || e.is_connect(),
            SpotifyError::Api(status, _) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Maps a non-success status to an error kind.
///
/// `player_command` distinguishes the player endpoints, where 404 means
/// "no active device" rather than "resource missing".
fn map_status(status: StatusCode, body: String, player_command: bool) -> SpotifyError {
    match status.as_u16() {
        401 => SpotifyError::Unauthorized,
        403 => SpotifyError::Forbidden,
        404 if player_command => SpotifyError::NoActiveDevice,
        404 => SpotifyError::NotFound,
        code => SpotifyError::Api(code, body),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn get_json<T: DeserializeOwned>(client: &Client, token: &str, url: &str) -> SpotifyResult<T> {
    let res = client.get(url).bearer_auth(token).send().await?;

    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(map_status(status, body, false));
    }

    res.json::<T>()
        .await
        .map_err(|e| SpotifyError::Parse(e.to_string()))
}

async fn put_player(
    client: &Client,
    token: &str,
    url: &str,
    body: Option<serde_json::Value>,
) -> SpotifyResult<()> {
    let mut request = client.put(url).bearer_auth(token);
    request = match body {
        Some(body) => request.json(&body),
        // The player endpoints require a Content-Length even for empty bodies
        None => request.header(reqwest::header::CONTENT_LENGTH, "0"),
    };

    let res = request.send().await?;
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(map_status(status, body, true));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire formats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    url: String,
    width: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireAlbum {
    name: String,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Debug, Deserialize)]
struct WireTrack {
    uri: String,
    name: String,
    #[serde(default)]
    artists: Vec<WireArtist>,
    album: Option<WireAlbum>,
    duration_ms: Option<u64>,
    #[serde(default)]
    is_local: bool,
}

#[derive(Debug, Deserialize)]
struct WireOwner {
    display_name: Option<String>,
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireTrackRef {
    total: usize,
}

#[derive(Debug, Deserialize)]
struct WirePlaylist {
    id: String,
    name: String,
    description: Option<String>,
    owner: WireOwner,
    tracks: WireTrackRef,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Debug, Deserialize)]
struct WirePlaylistItem {
    track: Option<WireTrack>,
}

#[derive(Debug, Deserialize)]
struct WirePage<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WireSavedTrack {
    track: WireTrack,
}

#[derive(Debug, Deserialize)]
struct WirePlayback {
    item: Option<WireTrack>,
    progress_ms: Option<u64>,
    is_playing: bool,
}

#[derive(Debug, Deserialize)]
struct WireMe {
    id: String,
    display_name: Option<String>,
    email: Option<String>,
}

fn largest_image(images: &[WireImage]) -> Option<String> {
    images
        .iter()
        .max_by_key(|i| i.width.unwrap_or(0))
        .map(|i| i.url.clone())
}

impl WireTrack {
    fn into_info(self) -> TrackInfo {
        let artist = self
            .artists
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let (album, album_art_url) = match self.album {
            Some(album) => {
                let art = largest_image(&album.images);
                (album.name, art)
            }
            None => (String::new(), None),
        };

        TrackInfo {
            uri: self.uri,
            name: self.name,
            artist,
            album,
            album_art_url,
            duration_ms: self.duration_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoints
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) async fn fetch_track(client: &Client, token: &str, id: &str) -> SpotifyResult<TrackInfo> {
    let url = format!("{API_BASE}/tracks/{id}");
    let track: WireTrack = get_json(client, token, &url).await?;
    Ok(track.into_info())
}

pub(crate) async fn fetch_playlist(
    client: &Client,
    token: &str,
    id: &str,
) -> SpotifyResult<PlaylistInfo> {
    let url = format!("{API_BASE}/playlists/{id}");
    let playlist: WirePlaylist = get_json(client, token, &url).await?;

    Ok(PlaylistInfo {
        image_url: largest_image(&playlist.images),
        id: playlist.id,
        name: playlist.name,
        description: playlist.description.unwrap_or_default(),
        owner: playlist.owner.display_name.unwrap_or(playlist.owner.id),
        track_count: playlist.tracks.total,
    })
}

/// Walks the playlist's track pages until a short page is returned.
pub(crate) async fn fetch_playlist_tracks(
    client: &Client,
    token: &str,
    id: &str,
) -> SpotifyResult<Vec<TrackInfo>> {
    let mut tracks = Vec::new();
    let mut offset = 0;

    loop {
        let url = format!("{API_BASE}/playlists/{id}/tracks?limit={PAGE_LIMIT}&offset={offset}");
        let page: WirePage<WirePlaylistItem> = get_json(client, token, &url).await?;
        let page_len = page.items.len();

        tracks.extend(
            page.items
                .into_iter()
                .filter_map(|item| item.track)
                .filter(|t| !t.is_local)
                .map(WireTrack::into_info),
        );

        if page_len < PAGE_LIMIT {
            break;
        }
        offset += PAGE_LIMIT;
    }

    Ok(tracks)
}

pub(crate) async fn player_play(
    client: &Client,
    token: &str,
    uris: &[String],
    position_ms: Option<u64>,
) -> SpotifyResult<()> {
    let url = format!("{API_BASE}/me/player/play");
    let mut body = json!({ "uris": uris });
    if let Some(position) = position_ms {
        body["position_ms"] = json!(position);
    }
    put_player(client, token, &url, Some(body)).await
}

pub(crate) async fn player_pause(client: &Client, token: &str) -> SpotifyResult<()> {
    let url = format!("{API_BASE}/me/player/pause");
    put_player(client, token, &url, None).await
}

/// Reads the account's current playback. Returns `None` when nothing is
/// playing (the provider answers 204 with no body).
pub(crate) async fn fetch_current_playback(
    client: &Client,
    token: &str,
) -> SpotifyResult<Option<PlaybackSnapshot>> {
    let url = format!("{API_BASE}/me/player");
    let res = client.get(&url).bearer_auth(token).send().await?;

    let status = res.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(map_status(status, body, false));
    }

    let playback: WirePlayback = res
        .json()
        .await
        .map_err(|e| SpotifyError::Parse(e.to_string()))?;

    // Local files and private sessions surface items we cannot identify;
    // report them as a blind snapshot (uri: None).
    let (uri, duration_ms) = match playback.item {
        Some(item) if !item.is_local && item.uri.starts_with("spotify:track:") => {
            (Some(item.uri), item.duration_ms.unwrap_or(0))
        }
        _ => (None, 0),
    };

    Ok(Some(PlaybackSnapshot {
        uri,
        progress_ms: playback.progress_ms.unwrap_or(0),
        duration_ms,
        is_playing: playback.is_playing,
    }))
}

/// Fetches up to the 50 most-recently liked tracks.
pub(crate) async fn fetch_recent_liked(
    client: &Client,
    token: &str,
) -> SpotifyResult<Vec<TrackInfo>> {
    let url = format!("{API_BASE}/me/tracks?limit={LIKED_LIMIT}");
    let page: WirePage<WireSavedTrack> = get_json(client, token, &url).await?;
    Ok(page
        .items
        .into_iter()
        .filter(|s| !s.track.is_local)
        .map(|s| s.track.into_info())
        .collect())
}

pub(crate) async fn fetch_me(client: &Client, token: &str) -> SpotifyResult<UserProfile> {
    let url = format!("{API_BASE}/me");
    let me: WireMe = get_json(client, token, &url).await?;

    let email = me
        .email
        .ok_or_else(|| SpotifyError::Parse("profile has no email (missing scope?)".into()))?;

    Ok(UserProfile {
        display_name: me.display_name.unwrap_or(me.id),
        email,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SpotifyError::Api(503, String::new()).is_transient());
        assert!(SpotifyError::Api(429, String::new()).is_transient());
        assert!(!SpotifyError::Api(400, String::new()).is_transient());
        assert!(!SpotifyError::Unauthorized.is_transient());
        assert!(!SpotifyError::NoActiveDevice.is_transient());
    }

    #[test]
    fn status_mapping_distinguishes_player_404() {
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, String::new(), true),
            SpotifyError::NoActiveDevice
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, String::new(), false),
            SpotifyError::NotFound
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, String::new(), false),
            SpotifyError::Unauthorized
        ));
    }

    #[test]
    fn wire_track_joins_artists_and_picks_largest_image() {
        let track = WireTrack {
            uri: "spotify:track:x".into(),
            name: "Song".into(),
            artists: vec![
                WireArtist { name: "A".into() },
                WireArtist { name: "B".into() },
            ],
            album: Some(WireAlbum {
                name: "Album".into(),
                images: vec![
                    WireImage {
                        url: "small".into(),
                        width: Some(64),
                    },
                    WireImage {
                        url: "large".into(),
                        width: Some(640),
                    },
                ],
            }),
            duration_ms: Some(1000),
            is_local: false,
        };

        let info = track.into_info();
        assert_eq!(info.artist, "A, B");
        assert_eq!(info.album_art_url.as_deref(), Some("large"));
    }

    #[test]
    fn playback_wire_parses_without_item() {
        let playback: WirePlayback =
            serde_json::from_str(r#"{"item":null,"progress_ms":null,"is_playing":false}"#).unwrap();
        assert!(playback.item.is_none());
        assert!(!playback.is_playing);
    }
}
