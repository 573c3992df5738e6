//! Participant session records.

use serde::{Deserialize, Serialize};

use crate::broadcast::Outbox;
use crate::utils::now_millis;

/// Whether a session mirrors the conductor's playback on its own account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowMode {
    #[default]
    Follow,
    Paused,
}

/// Provider credentials attached to an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix milliseconds when the access token expires.
    pub expires_at: u64,
}

/// One participant's connection to the room.
///
/// Identity is either provider-authenticated (name, email, credentials)
/// or listener-only (name, email). The transport handle is shared with
/// the transport edge but only that edge writes to the socket.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub credentials: Option<Credentials>,
    pub follow_mode: FollowMode,
    pub last_heartbeat: u64,
    pub created_at: u64,
    /// Sender half of the per-session outbound message channel; `None`
    /// while no transport is attached.
    pub outbox: Option<Outbox>,
    /// Whether this session has ever completed a login handshake; the
    /// `user_connected` history event fires only on the first one.
    pub greeted: bool,
}

impl Session {
    /// Creates an empty session (populated later by OAuth or listener login).
    #[must_use]
    pub fn new(id: String) -> Self {
        let now = now_millis();
        Self {
            id,
            name: None,
            email: None,
            credentials: None,
            follow_mode: FollowMode::default(),
            last_heartbeat: now,
            created_at: now,
            outbox: None,
            greeted: false,
        }
    }

    /// Creates a listener-only session.
    #[must_use]
    pub fn listener(id: String, name: String, email: String) -> Self {
        let mut session = Self::new(id);
        session.name = Some(name);
        session.email = Some(email);
        session
    }

    /// True when name and email are both present.
    #[must_use]
    pub fn has_listener_identity(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
            && self.email.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// True when the session holds provider credentials.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// A session may log in once either identity form is complete.
    #[must_use]
    pub fn identity_complete(&self) -> bool {
        self.has_listener_identity() || (self.has_credentials() && self.email.is_some())
    }

    /// Current access token, if any.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access_token.as_str())
    }

    /// Whether a transport is currently attached and writable.
    #[must_use]
    pub fn transport_open(&self) -> bool {
        self.outbox.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Case-insensitive email comparison.
    #[must_use]
    pub fn email_matches(&self, other: &str) -> bool {
        self.email
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(other))
    }

    /// Display name for history entries and the session directory.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "unknown".to_string())
    }

    /// The persisted form of a conductor-capable session.
    #[must_use]
    pub fn to_persisted(&self) -> Option<PersistedSession> {
        let credentials = self.credentials.clone()?;
        Some(PersistedSession {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            credentials,
            follow_mode: self.follow_mode,
        })
    }
}

/// A conductor-capable session as serialized to disk; the transport
/// handle is deliberately omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub credentials: Credentials,
    #[serde(default)]
    pub follow_mode: FollowMode,
}

impl From<PersistedSession> for Session {
    fn from(persisted: PersistedSession) -> Self {
        let mut session = Session::new(persisted.id);
        session.name = persisted.name;
        session.email = persisted.email;
        session.credentials = Some(persisted.credentials);
        session.follow_mode = persisted.follow_mode;
        session
    }
}

/// Directory entry broadcast in `sessions_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub email: String,
    pub is_conductor: bool,
}
