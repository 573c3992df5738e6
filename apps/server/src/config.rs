//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the HTTP + WebSocket server.
    /// Override: `CHORUS_LISTEN_PORT`
    pub listen_port: u16,

    /// URL the OAuth callback redirects back to.
    /// Override: `CHORUS_FRONTEND_URL`
    pub frontend_url: String,

    /// Reconciliation tick period in milliseconds.
    /// Override: `CHORUS_POLL_INTERVAL_MS`
    pub poll_interval_ms: u64,

    /// Stale session threshold in milliseconds.
    /// Override: `CHORUS_HEARTBEAT_TIMEOUT_MS`
    pub heartbeat_timeout_ms: u64,

    /// Emails permitted to take master control.
    /// Override: `CHORUS_CONTROL_ALLOWLIST` (comma-separated)
    pub control_allowlist: Vec<String>,

    /// Seed playlist for the fallback queue.
    /// Override: `CHORUS_FALLBACK_PLAYLIST`
    pub fallback_playlist: String,

    /// Directory for persistent state (queue, sessions, history).
    /// Override: `CHORUS_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Provider OAuth client id.
    /// Override: `CHORUS_SPOTIFY_CLIENT_ID`
    pub spotify_client_id: String,

    /// Provider OAuth client secret.
    /// Override: `CHORUS_SPOTIFY_CLIENT_SECRET`
    pub spotify_client_secret: String,

    /// Provider OAuth redirect URI (this server's `/callback` route).
    /// Override: `CHORUS_SPOTIFY_REDIRECT_URI`
    pub spotify_redirect_uri: String,

    /// Verbose reconciliation logging.
    /// Override: `CHORUS_DEBUG`
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = chorus_core::Config::default();
        Self {
            listen_port: core.listen_port,
            frontend_url: core.frontend_url,
            poll_interval_ms: core.poll_interval_ms,
            heartbeat_timeout_ms: core.heartbeat_timeout_ms,
            control_allowlist: Vec::new(),
            fallback_playlist: core.fallback_playlist,
            data_dir: None,
            spotify_client_id: String::new(),
            spotify_client_secret: String::new(),
            spotify_redirect_uri: String::new(),
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CHORUS_LISTEN_PORT") {
            if let Ok(port) = val.parse() {
                self.listen_port = port;
            }
        }

        if let Ok(val) = std::env::var("CHORUS_FRONTEND_URL") {
            self.frontend_url = val;
        }

        if let Ok(val) = std::env::var("CHORUS_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                self.poll_interval_ms = interval;
            }
        }

        if let Ok(val) = std::env::var("CHORUS_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                self.heartbeat_timeout_ms = timeout;
            }
        }

        if let Ok(val) = std::env::var("CHORUS_CONTROL_ALLOWLIST") {
            self.control_allowlist = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(val) = std::env::var("CHORUS_FALLBACK_PLAYLIST") {
            self.fallback_playlist = val;
        }

        if let Ok(val) = std::env::var("CHORUS_SPOTIFY_CLIENT_ID") {
            self.spotify_client_id = val;
        }

        if let Ok(val) = std::env::var("CHORUS_SPOTIFY_CLIENT_SECRET") {
            self.spotify_client_secret = val;
        }

        if let Ok(val) = std::env::var("CHORUS_SPOTIFY_REDIRECT_URI") {
            self.spotify_redirect_uri = val;
        }

        if let Ok(val) = std::env::var("CHORUS_DEBUG") {
            self.debug = matches!(val.as_str(), "1" | "true" | "yes");
        }

        // Note: CHORUS_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to chorus-core's Config type.
    pub fn to_core_config(&self) -> chorus_core::Config {
        chorus_core::Config {
            listen_port: self.listen_port,
            frontend_url: self.frontend_url.clone(),
            poll_interval_ms: self.poll_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            control_allowlist: self.control_allowlist.clone(),
            fallback_playlist: self.fallback_playlist.clone(),
            data_dir: self.data_dir.clone(),
            spotify: chorus_core::SpotifyConfig {
                client_id: self.spotify_client_id.clone(),
                client_secret: self.spotify_client_secret.clone(),
                redirect_uri: self.spotify_redirect_uri.clone(),
            },
            debug: self.debug,
        }
    }
}
