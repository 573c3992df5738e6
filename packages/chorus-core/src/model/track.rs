//! Queued track records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::spotify::TrackInfo;
use crate::utils::now_millis;

/// Sentinel submitter email carried by fallback-sourced tracks.
pub const FALLBACK_EMAIL: &str = "fallback@system";

/// Playback progress snapshot attached to the currently playing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackProgress {
    pub position_ms: u64,
    pub duration_ms: u64,
}

/// A reference to one provider song, as it lives in the queue.
///
/// The provider URI is the identity key: unique within the user queue,
/// and the value compared against the conductor's observed playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub uri: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,

    /// Submitter identity; both `None` only for fallback-origin tracks.
    #[serde(default)]
    pub added_by_name: Option<String>,
    #[serde(default)]
    pub added_by_email: Option<String>,
    pub added_at: u64,

    /// Jam counts per participant email; entries are always positive.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jam_counts: BTreeMap<String, u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TrackProgress>,

    /// Name of the source playlist, for fallback-sourced tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spotify_name: Option<String>,
}

impl Track {
    /// Builds a track from provider metadata and a submitter identity.
    #[must_use]
    pub fn from_info(info: TrackInfo, name: Option<String>, email: Option<String>) -> Self {
        Self {
            uri: info.uri,
            name: info.name,
            artist: info.artist,
            album: info.album,
            album_art_url: info.album_art_url,
            added_by_name: name,
            added_by_email: email,
            added_at: now_millis(),
            jam_counts: BTreeMap::new(),
            progress: None,
            spotify_name: None,
        }
    }

    /// Builds a fallback-queue track sourced from the given playlist.
    #[must_use]
    pub fn from_fallback(info: TrackInfo, playlist_name: &str) -> Self {
        let mut track = Self::from_info(info, None, Some(FALLBACK_EMAIL.to_string()));
        track.spotify_name = Some(playlist_name.to_string());
        track
    }

    /// Whether this track came from the fallback playlist.
    #[must_use]
    pub fn is_fallback_origin(&self) -> bool {
        self.added_by_email.as_deref() == Some(FALLBACK_EMAIL)
    }

    /// Increments the jam count for the given participant.
    pub fn jam(&mut self, email: &str) {
        *self.jam_counts.entry(email.to_string()).or_insert(0) += 1;
    }

    /// Decrements the jam count for the given participant, dropping the
    /// entry at zero so counts stay positive.
    pub fn unjam(&mut self, email: &str) {
        if let Some(count) = self.jam_counts.get_mut(email) {
            *count -= 1;
            if *count == 0 {
                self.jam_counts.remove(email);
            }
        }
    }

    /// Total jams across all participants.
    #[must_use]
    pub fn total_jams(&self) -> u32 {
        self.jam_counts.values().sum()
    }
}

/// A track as rendered to clients, tagged with its queue tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(flatten)]
    pub track: Track,
    pub is_fallback: bool,
}
