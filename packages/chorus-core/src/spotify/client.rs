//! High-level provider client implementation.
//!
//! `SpotifyClientImpl` is the concrete implementation of the
//! [`SpotifyApi`] trait. The actual request logic is split across
//! focused submodules:
//!
//! - `api` - REST transport, status mapping, wire parsing
//! - `auth` - OAuth grants
//! - `retry` - backoff for transient metadata failures
//! - `parse` - share URL / URI / bare id parsing

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::thread_rng;
use reqwest::Client;

use super::api::{self, SpotifyResult};
use super::auth;
use super::retry::with_retry;
use super::traits::SpotifyApi;
use super::types::{PlaybackSnapshot, PlaylistInfo, TokenGrant, TrackInfo, UserProfile};
use crate::state::SpotifyConfig;

/// Concrete implementation of the provider gateway.
pub struct SpotifyClientImpl {
    /// Shared HTTP client for connection pooling.
    client: Client,
    /// OAuth application credentials (needed for token refresh).
    config: SpotifyConfig,
}

impl std::fmt::Debug for SpotifyClientImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyClientImpl")
            .field("client_id", &self.config.client_id)
            .finish()
    }
}

impl SpotifyClientImpl {
    /// Creates a new client over the given HTTP client.
    #[must_use]
    pub fn new(client: Client, config: SpotifyConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClientImpl {
    async fn track_info(&self, token: &str, id: &str) -> SpotifyResult<TrackInfo> {
        with_retry("track_info", || api::fetch_track(&self.client, token, id)).await
    }

    async fn playlist_info(&self, token: &str, id: &str) -> SpotifyResult<PlaylistInfo> {
        with_retry("playlist_info", || {
            api::fetch_playlist(&self.client, token, id)
        })
        .await
    }

    async fn playlist_tracks(&self, token: &str, id: &str) -> SpotifyResult<Vec<TrackInfo>> {
        with_retry("playlist_tracks", || {
            api::fetch_playlist_tracks(&self.client, token, id)
        })
        .await
    }

    async fn play(
        &self,
        token: &str,
        uris: &[String],
        position_ms: Option<u64>,
    ) -> SpotifyResult<()> {
        api::player_play(&self.client, token, uris, position_ms).await
    }

    async fn pause(&self, token: &str) -> SpotifyResult<()> {
        api::player_pause(&self.client, token).await
    }

    async fn current_playback(&self, token: &str) -> SpotifyResult<Option<PlaybackSnapshot>> {
        api::fetch_current_playback(&self.client, token).await
    }

    async fn refresh(&self, refresh_token: &str) -> SpotifyResult<TokenGrant> {
        auth::refresh_grant(&self.client, &self.config, refresh_token).await
    }

    async fn random_liked(&self, token: &str, count: usize) -> SpotifyResult<Vec<TrackInfo>> {
        let mut liked =
            with_retry("random_liked", || api::fetch_recent_liked(&self.client, token)).await?;

        let mut rng = thread_rng();
        liked.shuffle(&mut rng);
        liked.truncate(count);
        Ok(liked)
    }

    async fn me(&self, token: &str) -> SpotifyResult<UserProfile> {
        with_retry("me", || api::fetch_me(&self.client, token)).await
    }
}
