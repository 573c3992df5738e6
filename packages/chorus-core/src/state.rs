//! Core application configuration.
//!
//! [`Config`] holds every tunable the room coordinator reads at runtime.
//! The server binary builds it from a YAML file, environment overrides, and
//! CLI flags, then hands it to [`crate::bootstrap::bootstrap_services`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Built-in fallback playlist used when none is configured.
pub const DEFAULT_FALLBACK_PLAYLIST: &str = "spotify:playlist:37i9dQZF1DXcBWIGoYBM5M";

/// OAuth application credentials for the music provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpotifyConfig {
    /// OAuth client id.
    pub client_id: String,

    /// OAuth client secret.
    pub client_secret: String,

    /// Redirect URI registered with the provider; must point at this
    /// server's `/callback` route.
    pub redirect_uri: String,
}

impl SpotifyConfig {
    /// Returns an error if any credential field is missing.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.is_empty() {
            return Err("spotify.client_id must be set".to_string());
        }
        if self.client_secret.is_empty() {
            return Err("spotify.client_secret must be set".to_string());
        }
        if self.redirect_uri.is_empty() {
            return Err("spotify.redirect_uri must be set".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Chorus room coordinator.
///
/// All fields except the provider credentials have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// Port for the HTTP + WebSocket server (both share one port).
    pub listen_port: u16,

    /// URL of the front-end the OAuth callback redirects back to.
    pub frontend_url: String,

    // Reconciliation
    /// Reconciliation tick period in milliseconds.
    pub poll_interval_ms: u64,

    /// Sessions whose last heartbeat is older than this are evicted.
    pub heartbeat_timeout_ms: u64,

    // Room policy
    /// Emails permitted to take master control.
    #[serde(default)]
    pub control_allowlist: Vec<String>,

    /// Seed playlist for the fallback queue.
    pub fallback_playlist: String,

    // Persistence
    /// Directory for queue/sessions/history files. `None` disables
    /// persistence (state is in-memory only).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Provider OAuth credentials.
    #[serde(default)]
    pub spotify: SpotifyConfig,

    /// Verbose reconciliation logging.
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be >= 1".to_string());
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err("heartbeat_timeout_ms must be >= 1".to_string());
        }
        if self.fallback_playlist.is_empty() {
            return Err("fallback_playlist must not be empty".to_string());
        }
        self.spotify.validate()
    }

    /// Returns true if the given email may take master control.
    #[must_use]
    pub fn email_allowed_control(&self, email: &str) -> bool {
        self.control_allowlist
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(email))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            frontend_url: "http://localhost:3000".to_string(),
            poll_interval_ms: 1000,
            heartbeat_timeout_ms: 60_000,
            control_allowlist: Vec::new(),
            fallback_playlist: DEFAULT_FALLBACK_PLAYLIST.to_string(),
            data_dir: None,
            spotify: SpotifyConfig::default(),
            debug: false,
        }
    }
}
