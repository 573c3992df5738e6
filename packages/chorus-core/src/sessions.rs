//! The session registry: participant state keyed by session id.
//!
//! Lives inside the room's serialized mutation section, so a plain map is
//! sufficient; the registry adds the identity-centric lookups the room
//! needs (case-insensitive email dedup, conductor election, a
//! deduplicated directory view).

use std::collections::HashMap;

use crate::model::{Session, SessionSummary};

/// Map of session-id → participant state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Removes every *other* session sharing the given email
    /// (case-insensitive), returning the evicted sessions.
    pub fn evict_duplicates(&mut self, email: &str, keep_id: &str) -> Vec<Session> {
        let duplicate_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.id != keep_id && s.email_matches(email))
            .map(|s| s.id.clone())
            .collect();

        duplicate_ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }

    /// First session holding provider credentials, for conductor election.
    /// Oldest wins so an established conductor is not displaced by a
    /// late-joining authenticated session.
    #[must_use]
    pub fn first_with_credentials(&self) -> Option<&Session> {
        self.sessions
            .values()
            .filter(|s| s.has_credentials())
            .min_by_key(|s| s.created_at)
    }

    /// Sessions whose last heartbeat is older than the timeout.
    #[must_use]
    pub fn stale_ids(&self, now: u64, timeout_ms: u64) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| now.saturating_sub(s.last_heartbeat) > timeout_ms)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Sessions that mirror playback: credentialled and in follow mode.
    #[must_use]
    pub fn followers(&self) -> Vec<(String, String)> {
        self.sessions
            .values()
            .filter(|s| s.follow_mode == crate::model::FollowMode::Follow)
            .filter_map(|s| {
                s.access_token()
                    .map(|token| (s.id.clone(), token.to_string()))
            })
            .collect()
    }

    /// The deduplicated participant directory: one entry per email
    /// (newest session wins), identity-complete sessions only.
    #[must_use]
    pub fn summaries(&self, conductor_id: Option<&str>) -> Vec<SessionSummary> {
        let mut newest_per_email: HashMap<String, &Session> = HashMap::new();
        for session in self.sessions.values() {
            let Some(email) = session.email.as_deref() else {
                continue;
            };
            if session.name.is_none() {
                continue;
            }
            let key = email.to_ascii_lowercase();
            let entry = newest_per_email.entry(key).or_insert(session);
            if session.created_at > entry.created_at {
                *entry = session;
            }
        }

        let mut summaries: Vec<SessionSummary> = newest_per_email
            .into_values()
            .map(|s| SessionSummary {
                session_id: s.id.clone(),
                name: s.display_name(),
                email: s.email.clone().unwrap_or_default(),
                is_conductor: conductor_id == Some(s.id.as_str()),
            })
            .collect();

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}
