//! Provider gateway: typed adapter for the external music provider.
//!
//! Parses user references, fetches metadata, commands playback, reads the
//! conductor's real player, and refreshes credentials. Submodules:
//!
//! - `parse` - share URL / URI / bare id parsing
//! - `api` - REST transport and error mapping
//! - `auth` - OAuth authorization and token grants
//! - `client` - [`SpotifyApi`] trait implementation
//! - `retry` - backoff for transient metadata failures

pub mod api;
pub mod auth;
pub mod client;
pub mod parse;
mod retry;
pub mod traits;
pub mod types;

pub use api::{SpotifyError, SpotifyResult};
pub use client::SpotifyClientImpl;
pub use parse::{parse_resource, ParsedResource, ResourceKind};
pub use traits::SpotifyApi;
pub use types::{PlaybackSnapshot, PlaylistInfo, TokenGrant, TrackInfo, UserProfile};
