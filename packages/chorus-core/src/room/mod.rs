//! The room service: the single serialized mutation hub.
//!
//! Responsibilities:
//! - Own every piece of mutable room state (queue, sessions, history,
//!   playback state) behind one mutex
//! - Apply inbound participant actions (submissions, jams, master controls)
//! - Run the "set-and-start" operation that drives follower players
//! - Feed the broadcast fabric after every mutation
//! - Persist queue, sessions, and history as they change
//!
//! The reconciliation tick lives in [`reconciler`]; it calls back into the
//! same lock. Provider I/O never happens while the lock is held: tokens
//! are cloned out, the call is awaited, and results are re-applied.

pub mod reconciler;

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broadcast::{Outbox, OutboundMessage};
use crate::error::{ChorusError, ChorusResult};
use crate::history::{HistoryLedger, PlayHistory};
use crate::model::{
    Credentials, FollowMode, HistoryEvent, HistoryKind, PlaybackMode, PlayedTrack, Session, Track,
};
use crate::persist::StateStore;
use crate::queue::TrackQueue;
use crate::sessions::SessionRegistry;
use crate::spotify::{
    parse_resource, PlaybackSnapshot, PlaylistInfo, ResourceKind, SpotifyApi, SpotifyError,
    SpotifyResult, TokenGrant,
};
use crate::state::Config;
use crate::utils::{now_millis, random_id};

/// Suppression window after a commanded track change or manual skip.
pub(crate) const GRACE_WINDOW_MS: u64 = 3000;

/// How long a nominated track may take to be observed playing.
pub(crate) const FAILURE_WINDOW_MS: u64 = 5000;

/// Minimum delay between fallback sourcing attempts.
const FALLBACK_RETRY_MS: u64 = 60_000;

/// Tracks added by one `master-random-liked` request.
const RANDOM_LIKED_COUNT: usize = 3;

/// Length of generated session ids.
const SESSION_ID_LEN: usize = 32;

/// A nominated track the loop is waiting to observe playing.
#[derive(Debug, Clone)]
pub(crate) struct ExpectedPlayback {
    pub uri: String,
    pub is_fallback: bool,
    pub deadline_ms: u64,
}

/// All mutable room state; only ever touched under [`Room::inner`].
pub(crate) struct RoomInner {
    pub queue: TrackQueue,
    pub sessions: SessionRegistry,
    pub history: HistoryLedger,
    pub play_history: PlayHistory,

    pub mode: PlaybackMode,
    pub current: Option<Track>,
    pub current_is_fallback: bool,
    /// Whether the current track has been consumed from its queue tier.
    pub current_consumed: bool,
    pub current_started_by: Option<String>,

    pub conductor_id: Option<String>,
    pub last_commanded_ms: u64,
    pub last_manual_skip_ms: u64,
    pub last_snapshot: Option<PlaybackSnapshot>,
    pub expected: Option<ExpectedPlayback>,

    pub fallback_playlist: Option<PlaylistInfo>,
    pub fallback_last_attempt_ms: u64,

    /// Set when a freshly elected conductor's real playback should be
    /// adopted as the room's initial state.
    pub needs_adoption: bool,
}

impl RoomInner {
    fn new() -> Self {
        Self {
            queue: TrackQueue::new(),
            sessions: SessionRegistry::new(),
            history: HistoryLedger::new(),
            play_history: PlayHistory::new(),
            mode: PlaybackMode::Paused,
            current: None,
            current_is_fallback: false,
            current_consumed: false,
            current_started_by: None,
            conductor_id: None,
            last_commanded_ms: 0,
            last_manual_skip_ms: 0,
            last_snapshot: None,
            expected: None,
            fallback_playlist: None,
            fallback_last_attempt_ms: 0,
            needs_adoption: false,
        }
    }

    /// Token of the conductor session, if one is set and still valid.
    pub(crate) fn conductor_token(&self) -> Option<(String, String)> {
        let id = self.conductor_id.as_deref()?;
        let session = self.sessions.get(id)?;
        session
            .access_token()
            .map(|token| (id.to_string(), token.to_string()))
    }

    /// Display name of the conductor session, if any.
    pub(crate) fn conductor_name(&self) -> Option<String> {
        self.conductor_id
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .map(Session::display_name)
    }

    /// Whether `now` falls inside the commanded-change grace window.
    pub(crate) fn in_grace(&self, now: u64) -> bool {
        now < self.last_commanded_ms.saturating_add(GRACE_WINDOW_MS)
            || now < self.last_manual_skip_ms.saturating_add(GRACE_WINDOW_MS)
    }
}

/// The shared-listening room coordinator.
pub struct Room {
    pub(crate) inner: Mutex<RoomInner>,
    pub(crate) spotify: Arc<dyn SpotifyApi>,
    store: StateStore,
    pub(crate) config: Arc<Config>,
    /// Wakes the reconciler for an immediate tick after state changes
    /// that should not wait out a full poll period.
    pub(crate) tick_nudge: Notify,
}

impl Room {
    /// Creates an empty room.
    #[must_use]
    pub fn new(spotify: Arc<dyn SpotifyApi>, store: StateStore, config: Arc<Config>) -> Self {
        Self {
            inner: Mutex::new(RoomInner::new()),
            spotify,
            store,
            config,
            tick_nudge: Notify::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Broadcast helpers
    // ─────────────────────────────────────────────────────────────────────

    fn send_to(session: &Session, message: OutboundMessage) {
        if let Some(outbox) = &session.outbox {
            // A closed transport is skipped silently; eviction belongs to
            // the stale-session sweep, not the broadcast path.
            let _ = outbox.send(message);
        }
    }

    fn broadcast_all(inner: &RoomInner, message: OutboundMessage) {
        for session in inner.sessions.iter() {
            Self::send_to(session, message.clone());
        }
    }

    fn tracks_list(inner: &RoomInner) -> OutboundMessage {
        OutboundMessage::TracksList {
            tracks: inner.queue.display(),
        }
    }

    fn broadcast_tracks(inner: &RoomInner) {
        Self::broadcast_all(inner, Self::tracks_list(inner));
    }

    /// The `mode` payload for one recipient; control eligibility is
    /// per-session.
    fn mode_message(&self, inner: &RoomInner, recipient: &Session) -> OutboundMessage {
        let can_take = recipient
            .email
            .as_deref()
            .is_some_and(|email| self.config.email_allowed_control(email))
            && recipient.has_credentials();

        OutboundMessage::Mode {
            mode: inner.mode,
            current_track: inner.current.clone(),
            conductor_id: inner.conductor_id.clone(),
            can_take_master_control: can_take,
            fallback_playlist: inner.fallback_playlist.clone(),
        }
    }

    fn broadcast_mode(&self, inner: &RoomInner) {
        for session in inner.sessions.iter() {
            Self::send_to(session, self.mode_message(inner, session));
        }
    }

    fn broadcast_sessions(inner: &RoomInner) {
        let message = OutboundMessage::SessionsList {
            sessions: inner.sessions.summaries(inner.conductor_id.as_deref()),
        };
        Self::broadcast_all(inner, message);
    }

    fn broadcast_play_history(inner: &RoomInner) {
        let message = OutboundMessage::PlayHistory {
            tracks: inner.play_history.recent(),
        };
        Self::broadcast_all(inner, message);
    }

    /// Appends a history event, persists the ledger, and broadcasts the
    /// bounded view.
    pub(crate) fn append_history(&self, inner: &mut RoomInner, event: HistoryEvent) {
        inner.history.push(event);
        self.store.save_history(&inner.history.all());
        let message = OutboundMessage::History {
            events: inner.history.recent(),
        };
        Self::broadcast_all(inner, message);
    }

    pub(crate) fn persist_queue(&self, inner: &RoomInner) {
        self.store.save_queue(inner.queue.tracks());
    }

    fn persist_sessions(&self, inner: &RoomInner) {
        let persisted: Vec<_> = inner
            .sessions
            .iter()
            .filter_map(Session::to_persisted)
            .collect();
        self.store.save_sessions(&persisted);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a listener-only session, returning its id.
    pub fn create_listener(&self, name: &str, email: &str) -> ChorusResult<String> {
        if name.trim().is_empty() || email.trim().is_empty() {
            return Err(ChorusError::InvalidInput(
                "name and email are required".into(),
            ));
        }

        let id = random_id(SESSION_ID_LEN);
        let session = Session::listener(id.clone(), name.trim().to_string(), email.trim().to_string());

        let mut inner = self.inner.lock();
        inner.sessions.insert(session);
        log::info!("[Room] Listener session created for {}", email);
        Ok(id)
    }

    /// Creates an empty session to carry an OAuth round-trip.
    pub fn create_session(&self) -> String {
        let id = random_id(SESSION_ID_LEN);
        let mut inner = self.inner.lock();
        inner.sessions.insert(Session::new(id.clone()));
        id
    }

    /// Whether a session id refers to a login-capable session.
    #[must_use]
    pub fn logged_in(&self, session_id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(session_id)
            .is_some_and(Session::identity_complete)
    }

    /// Populates a session from a completed OAuth grant.
    pub async fn complete_oauth(&self, session_id: &str, grant: TokenGrant) -> ChorusResult<()> {
        let profile = self.spotify.me(&grant.access_token).await?;

        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;

        session.name = Some(profile.display_name.clone());
        session.email = Some(profile.email.clone());
        session.credentials = Some(Credentials {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or_default(),
            expires_at: now_millis() + grant.expires_in * 1000,
        });

        log::info!(
            "[Room] OAuth completed for {} ({})",
            profile.display_name,
            profile.email
        );
        self.persist_sessions(&inner);
        Ok(())
    }

    /// Attaches a transport to a session and runs the login protocol:
    /// identity validation, email dedup, conductor election, initial
    /// snapshots, and directory rebroadcast.
    pub fn login(&self, session_id: &str, outbox: Outbox) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
        if !session.identity_complete() {
            return Err(ChorusError::UnauthorizedSession(
                "session has no usable identity".into(),
            ));
        }

        session.outbox = Some(outbox);
        session.last_heartbeat = now_millis();
        let first_attach = !session.greeted;
        session.greeted = true;

        let name = session.display_name();
        let email = session.email.clone().unwrap_or_default();
        let has_token = session.access_token().is_some();

        // De-duplication by identity: the newcomer wins
        let mut conductor_changed = false;
        if !email.is_empty() {
            let evicted = inner.sessions.evict_duplicates(&email, session_id);
            for old in &evicted {
                log::info!("[Room] Evicting duplicate session {} for {}", old.id, email);
                Self::send_to(
                    old,
                    OutboundMessage::LoginError {
                        message: "logged in from another session".into(),
                    },
                );
            }
            let evicted_conductor = evicted
                .iter()
                .any(|old| inner.conductor_id.as_deref() == Some(old.id.as_str()));
            if evicted_conductor {
                inner.conductor_id = has_token.then(|| session_id.to_string());
                conductor_changed = true;
            }
        }

        // Conductor assignment: first provider-capable session drives
        if inner.conductor_id.is_none() {
            if let Some(candidate) = inner.sessions.first_with_credentials() {
                inner.conductor_id = Some(candidate.id.clone());
                inner.needs_adoption = inner.current.is_none();
                conductor_changed = true;
                log::info!("[Room] Conductor assigned: {}", candidate.id);
            }
        }

        if first_attach {
            self.append_history(
                inner,
                HistoryEvent::for_actor(HistoryKind::UserConnected, &name, &email),
            );
        }

        // Initial snapshots to the newcomer
        if let Some(session) = inner.sessions.get(session_id) {
            Self::send_to(
                session,
                OutboundMessage::LoginSuccess {
                    session_id: session_id.to_string(),
                },
            );
            Self::send_to(session, Self::tracks_list(inner));
            Self::send_to(session, self.mode_message(inner, session));
            Self::send_to(
                session,
                OutboundMessage::SessionMode {
                    mode: session.follow_mode,
                },
            );
            Self::send_to(
                session,
                OutboundMessage::History {
                    events: inner.history.recent(),
                },
            );
            Self::send_to(
                session,
                OutboundMessage::PlayHistory {
                    tracks: inner.play_history.recent(),
                },
            );
        }

        Self::broadcast_sessions(inner);
        if conductor_changed {
            self.broadcast_mode(inner);
            self.tick_nudge.notify_one();
        }

        Ok(())
    }

    /// Updates a session's heartbeat; returns false for unknown sessions.
    pub fn heartbeat(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                session.last_heartbeat = now_millis();
                true
            }
            None => false,
        }
    }

    /// Clears a session's transport handle on socket close. The session
    /// itself survives until the stale sweep evicts it. A handle that a
    /// newer connection has already replaced is left alone.
    pub fn detach(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(session_id) {
            if session.outbox.as_ref().is_some_and(|tx| tx.is_closed()) {
                session.outbox = None;
            }
        }
    }

    /// Evicts sessions whose heartbeat went stale.
    pub fn cleanup_stale(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let now = now_millis();
        let stale = inner
            .sessions
            .stale_ids(now, self.config.heartbeat_timeout_ms);
        if stale.is_empty() {
            return;
        }

        let mut conductor_lost = false;
        let mut credentials_changed = false;
        for id in stale {
            if let Some(session) = inner.sessions.remove(&id) {
                log::info!("[Room] Evicting stale session {}", id);
                if inner.conductor_id.as_deref() == Some(id.as_str()) {
                    conductor_lost = true;
                    inner.conductor_id = None;
                }
                credentials_changed |= session.has_credentials();
                self.append_history(
                    inner,
                    HistoryEvent::for_actor(
                        HistoryKind::UserDisconnected,
                        &session.display_name(),
                        session.email.as_deref().unwrap_or(""),
                    ),
                );
            }
        }

        if conductor_lost {
            if let Some(candidate) = inner.sessions.first_with_credentials() {
                inner.conductor_id = Some(candidate.id.clone());
                log::info!("[Room] Conductor reassigned: {}", candidate.id);
            }
            self.broadcast_mode(inner);
            self.tick_nudge.notify_one();
        }
        if credentials_changed {
            self.persist_sessions(inner);
        }
        Self::broadcast_sessions(inner);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queue operations
    // ─────────────────────────────────────────────────────────────────────

    /// Handles a track or playlist submission.
    pub async fn submit_track(&self, session_id: &str, input: &str) -> ChorusResult<()> {
        let (actor_name, actor_email) = {
            let inner = self.inner.lock();
            let session = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
            (session.name.clone(), session.email.clone())
        };

        let parsed = parse_resource(input).ok_or_else(|| {
            ChorusError::InvalidInput(format!("not a recognizable track or playlist: {input}"))
        })?;

        match parsed.kind {
            ResourceKind::Track => {
                self.submit_single_track(&parsed.id, actor_name, actor_email)
                    .await
            }
            ResourceKind::Playlist => self.replace_fallback(&parsed.id).await,
            other => Err(ChorusError::InvalidInput(format!(
                "only tracks and playlists can be submitted, not {}",
                other.as_str()
            ))),
        }
    }

    async fn submit_single_track(
        &self,
        track_id: &str,
        actor_name: Option<String>,
        actor_email: Option<String>,
    ) -> ChorusResult<()> {
        let (session_id, _) = self.metadata_session()?;
        let spotify = Arc::clone(&self.spotify);
        let id = track_id.to_string();
        let info = self
            .with_session_token(&session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                let id = id.clone();
                Box::pin(async move { spotify.track_info(&token, &id).await })
            })
            .await?;

        let track = Track::from_info(info, actor_name.clone(), actor_email.clone());

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner
                .queue
                .add(track.clone())
                .map_err(|e| ChorusError::InvalidInput(e.to_string()))?;

            self.append_history(
                inner,
                HistoryEvent::for_track(
                    HistoryKind::TrackAdded,
                    &actor_name.unwrap_or_else(|| "unknown".into()),
                    actor_email.as_deref().unwrap_or(""),
                    &track,
                ),
            );
            Self::broadcast_tracks(inner);
            self.persist_queue(inner);
        }

        self.tick_nudge.notify_one();
        Ok(())
    }

    /// Validates and swaps in a new fallback playlist. The previous
    /// fallback is kept on any provider failure.
    async fn replace_fallback(&self, playlist_id: &str) -> ChorusResult<()> {
        let (session_id, _) = self.metadata_session()?;

        let spotify = Arc::clone(&self.spotify);
        let id = playlist_id.to_string();
        let playlist = self
            .with_session_token(&session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                let id = id.clone();
                Box::pin(async move { spotify.playlist_info(&token, &id).await })
            })
            .await?;

        let spotify = Arc::clone(&self.spotify);
        let id = playlist_id.to_string();
        let tracks = self
            .with_session_token(&session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                let id = id.clone();
                Box::pin(async move { spotify.playlist_tracks(&token, &id).await })
            })
            .await?;

        let fallback: Vec<Track> = tracks
            .into_iter()
            .map(|info| Track::from_fallback(info, &playlist.name))
            .collect();

        log::info!(
            "[Room] Fallback playlist replaced: {} ({} tracks)",
            playlist.name,
            fallback.len()
        );

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.queue.set_fallback(fallback);
        inner.fallback_playlist = Some(playlist);
        Self::broadcast_tracks(inner);
        self.broadcast_mode(inner);
        Ok(())
    }

    /// Removes a user-queue entry.
    pub fn remove_track(&self, uri: &str) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner
            .queue
            .remove(uri)
            .ok_or_else(|| ChorusError::InvalidInput(format!("track not in queue: {uri}")))?;
        Self::broadcast_tracks(inner);
        self.persist_queue(inner);
        Ok(())
    }

    /// Swaps a user-queue entry with its successor.
    pub fn delay_track(&self, uri: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.queue.delay_one(uri) {
            Self::broadcast_tracks(inner);
            self.persist_queue(inner);
        }
    }

    /// Applies a jam (or unjam) from a participant to the referenced track.
    ///
    /// Jamming a fallback track that is not currently playing promotes it
    /// into the user queue as the jammer's submission. Jamming the
    /// currently playing track is always a plain jam, fallback or not.
    pub fn jam(&self, session_id: &str, uri: &str, unjam: bool) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
        let name = session.display_name();
        let email = session
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ChorusError::InvalidInput("jamming requires an identity".into()))?;

        let kind = if unjam {
            HistoryKind::Unjam
        } else {
            HistoryKind::Jam
        };

        // Currently playing track: plain jam regardless of origin
        if inner.current.as_ref().is_some_and(|t| t.uri == uri) {
            let track = inner.current.as_mut().expect("current checked above");
            if unjam {
                track.unjam(&email);
            } else {
                track.jam(&email);
            }
            let snapshot = track.clone();
            self.append_history(inner, HistoryEvent::for_track(kind, &name, &email, &snapshot));
            self.broadcast_mode(inner);
            return Ok(());
        }

        // Queued user track
        if inner.queue.find(uri).is_some() {
            let track = inner.queue.find_mut(uri).expect("presence checked above");
            if unjam {
                track.unjam(&email);
            } else {
                track.jam(&email);
            }
            let snapshot = track.clone();
            self.append_history(inner, HistoryEvent::for_track(kind, &name, &email, &snapshot));
            Self::broadcast_tracks(inner);
            self.persist_queue(inner);
            return Ok(());
        }

        // Fallback track not currently playing: promotion
        if !unjam {
            if let Some(mut track) = inner.queue.remove_fallback(uri) {
                track.added_by_name = Some(name.clone());
                track.added_by_email = Some(email.clone());
                track.added_at = now_millis();
                track.spotify_name = None;
                track.jam_counts.clear();
                track.jam(&email);

                inner
                    .queue
                    .add(track.clone())
                    .map_err(|e| ChorusError::Internal(e.to_string()))?;
                log::info!("[Room] Fallback track promoted by {}: {}", email, uri);

                self.append_history(
                    inner,
                    HistoryEvent::for_track(HistoryKind::Jam, &name, &email, &track),
                );
                Self::broadcast_tracks(inner);
                self.persist_queue(inner);
                return Ok(());
            }
        }

        Err(ChorusError::InvalidInput(format!(
            "track not found: {uri}"
        )))
    }

    /// Adds a few random tracks from the conductor's liked library.
    pub async fn random_liked(&self, session_id: &str) -> ChorusResult<usize> {
        self.require_conductor(session_id)?;

        let (actor_name, actor_email) = {
            let inner = self.inner.lock();
            let session = inner.sessions.get(session_id);
            (
                session.map(Session::display_name),
                session.and_then(|s| s.email.clone()),
            )
        };

        let spotify = Arc::clone(&self.spotify);
        let picks = self
            .with_session_token(session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                Box::pin(async move { spotify.random_liked(&token, RANDOM_LIKED_COUNT).await })
            })
            .await?;

        let mut added = 0;
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            for info in picks {
                let track = Track::from_info(info, actor_name.clone(), actor_email.clone());
                if inner.queue.add(track.clone()).is_ok() {
                    self.append_history(
                        inner,
                        HistoryEvent::for_track(
                            HistoryKind::TrackAdded,
                            actor_name.as_deref().unwrap_or("unknown"),
                            actor_email.as_deref().unwrap_or(""),
                            &track,
                        ),
                    );
                    added += 1;
                }
            }
            if added > 0 {
                Self::broadcast_tracks(inner);
                self.persist_queue(inner);
            }
        }

        self.tick_nudge.notify_one();
        Ok(added)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playback controls
    // ─────────────────────────────────────────────────────────────────────

    /// Starts (or resumes) room playback. Conductor only.
    pub async fn master_play(&self, session_id: &str) -> ChorusResult<()> {
        let actor = self.require_conductor(session_id)?;

        enum Action {
            Resume(Track),
            StartNext,
            Nothing,
        }

        let action = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.mode == PlaybackMode::Playing {
                Action::Nothing
            } else {
                inner.mode = PlaybackMode::Playing;
                match inner.current.clone() {
                    Some(track) => {
                        inner.last_commanded_ms = now_millis();
                        self.broadcast_mode(inner);
                        Action::Resume(track)
                    }
                    None => Action::StartNext,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Resume(track) => {
                let position = track.progress.map(|p| p.position_ms);
                let players = {
                    let inner = self.inner.lock();
                    inner.sessions.followers()
                };
                let uris = vec![track.uri.clone()];
                join_all(players.into_iter().map(|(sid, _)| {
                    self.play_for_session(sid, uris.clone(), position)
                }))
                .await;
            }
            Action::StartNext => {
                self.start_next(Some(actor)).await;
            }
        }

        self.tick_nudge.notify_one();
        Ok(())
    }

    /// Pauses room playback on every mirroring player. Conductor only.
    pub async fn master_pause(&self, session_id: &str) -> ChorusResult<()> {
        self.require_conductor(session_id)?;

        let players = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.mode = PlaybackMode::Paused;
            inner.last_commanded_ms = now_millis();
            self.broadcast_mode(inner);

            // Followers plus the conductor's own player
            let mut players = inner.sessions.followers();
            if let Some((sid, token)) = inner.conductor_token() {
                if !players.iter().any(|(id, _)| id == &sid) {
                    players.push((sid, token));
                }
            }
            players
        };

        join_all(
            players
                .into_iter()
                .map(|(sid, _)| self.pause_for_session(sid)),
        )
        .await;
        Ok(())
    }

    /// Skips the current track. Conductor only.
    pub async fn master_skip(&self, session_id: &str) -> ChorusResult<()> {
        let actor = self.require_conductor(session_id)?;

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let skipped = inner.current.clone();
            self.finish_current(inner);
            inner.last_manual_skip_ms = now_millis();
            inner.expected = None;

            if let Some(track) = skipped {
                let email = inner
                    .sessions
                    .get(session_id)
                    .and_then(|s| s.email.clone())
                    .unwrap_or_default();
                self.append_history(
                    inner,
                    HistoryEvent::for_track(HistoryKind::TrackSkip, &actor, &email, &track),
                );
            }
        }

        self.start_next(Some(actor)).await;
        self.tick_nudge.notify_one();
        Ok(())
    }

    /// Force-nominates the head of the fallback queue.
    pub async fn start_fallback(&self, session_id: &str) -> ChorusResult<()> {
        let (actor, next) = {
            let inner = self.inner.lock();
            let session = inner
                .sessions
                .get(session_id)
                .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
            (session.display_name(), inner.queue.fallback().first().cloned())
        };

        let track =
            next.ok_or_else(|| ChorusError::InvalidInput("the fallback queue is empty".into()))?;

        self.set_and_start(Some(actor), track, true).await;
        self.tick_nudge.notify_one();
        Ok(())
    }

    /// Sets the caller's follower mode to follow and aligns its player.
    pub async fn session_play(&self, session_id: &str) -> ChorusResult<()> {
        let current = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
            session.follow_mode = FollowMode::Follow;
            Self::send_to(
                session,
                OutboundMessage::SessionMode {
                    mode: FollowMode::Follow,
                },
            );
            let current = inner.current.clone();
            if let (Some(track), Some(session)) = (&current, inner.sessions.get(session_id)) {
                Self::send_to(
                    session,
                    OutboundMessage::PlayTrack {
                        track: track.clone(),
                    },
                );
            }
            current
        };

        if let Some(track) = current {
            let position = track.progress.map(|p| p.position_ms);
            self.play_for_session(session_id.to_string(), vec![track.uri], position)
                .await;
        }
        Ok(())
    }

    /// Sets the caller's follower mode to paused.
    pub fn session_pause(&self, session_id: &str) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
        session.follow_mode = FollowMode::Paused;
        Self::send_to(
            session,
            OutboundMessage::SessionMode {
                mode: FollowMode::Paused,
            },
        );
        Ok(())
    }

    /// Fans an airhorn out to the whole room.
    pub fn airhorn(&self, session_id: &str, name: &str) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
        let actor = session.display_name();
        let email = session.email.clone().unwrap_or_default();

        Self::broadcast_all(
            inner,
            OutboundMessage::PlayAirhorn {
                name: name.to_string(),
            },
        );
        self.append_history(
            inner,
            HistoryEvent::for_actor(HistoryKind::Airhorn, &actor, &email),
        );
        Ok(())
    }

    /// Reassigns the conductor role to an allow-listed, provider-capable
    /// session.
    pub fn take_master_control(&self, session_id: &str) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;

        let allowed = session
            .email
            .as_deref()
            .is_some_and(|email| self.config.email_allowed_control(email));
        if !allowed || session.access_token().is_none() {
            return Err(ChorusError::ControlDenied);
        }

        inner.conductor_id = Some(session_id.to_string());
        inner.needs_adoption = inner.current.is_none();
        log::info!("[Room] Master control taken by {}", session_id);
        self.broadcast_mode(inner);
        self.tick_nudge.notify_one();
        Ok(())
    }

    /// Appends a chat message to the history.
    pub fn history_message(&self, session_id: &str, message: &str) -> ChorusResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ChorusError::UnauthorizedSession("unknown session id".into()))?;
        let actor = session.display_name();
        let email = session.email.clone().unwrap_or_default();

        self.append_history(inner, HistoryEvent::for_message(&actor, &email, message));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Snapshot accessors (request/response messages)
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn tracks_message(&self) -> OutboundMessage {
        let inner = self.inner.lock();
        Self::tracks_list(&inner)
    }

    #[must_use]
    pub fn sessions_message(&self) -> OutboundMessage {
        let inner = self.inner.lock();
        OutboundMessage::SessionsList {
            sessions: inner.sessions.summaries(inner.conductor_id.as_deref()),
        }
    }

    #[must_use]
    pub fn play_history_message(&self) -> OutboundMessage {
        let inner = self.inner.lock();
        OutboundMessage::PlayHistory {
            tracks: inner.play_history.recent(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    /// Ensures the caller is the conductor; returns their display name.
    fn require_conductor(&self, session_id: &str) -> ChorusResult<String> {
        let inner = self.inner.lock();
        if inner.conductor_id.as_deref() != Some(session_id) {
            return Err(ChorusError::NotConductor);
        }
        Ok(inner
            .sessions
            .get(session_id)
            .map(Session::display_name)
            .unwrap_or_default())
    }

    /// A session whose credentials can serve metadata lookups: the
    /// conductor's, or any provider-capable session.
    fn metadata_session(&self) -> ChorusResult<(String, String)> {
        let inner = self.inner.lock();
        inner
            .conductor_token()
            .or_else(|| {
                inner.sessions.first_with_credentials().and_then(|s| {
                    s.access_token()
                        .map(|token| (s.id.clone(), token.to_string()))
                })
            })
            .ok_or_else(|| {
                ChorusError::Provider("no authenticated provider session available".into())
            })
    }

    /// Runs a provider call with the session's token, refreshing and
    /// retrying once when the token is rejected.
    pub(crate) async fn with_session_token<T>(
        &self,
        session_id: &str,
        op: impl Fn(String) -> BoxFuture<'static, SpotifyResult<T>>,
    ) -> Result<T, SpotifyError> {
        let token = {
            let inner = self.inner.lock();
            inner
                .sessions
                .get(session_id)
                .and_then(|s| s.access_token().map(str::to_string))
        }
        .ok_or(SpotifyError::Unauthorized)?;

        match op(token).await {
            Err(SpotifyError::Unauthorized) => {
                match self.refresh_session_credentials(session_id).await {
                    Some(token) => op(token).await,
                    None => Err(SpotifyError::Unauthorized),
                }
            }
            other => other,
        }
    }

    /// Refreshes a session's credentials; on failure the credentials are
    /// dropped (the session itself is kept).
    pub(crate) async fn refresh_session_credentials(&self, session_id: &str) -> Option<String> {
        let refresh_token = {
            let inner = self.inner.lock();
            inner
                .sessions
                .get(session_id)
                .and_then(|s| s.credentials.as_ref())
                .map(|c| c.refresh_token.clone())
        }?;

        match self.spotify.refresh(&refresh_token).await {
            Ok(grant) => {
                let access_token = grant.access_token.clone();
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(session) = inner.sessions.get_mut(session_id) {
                    session.credentials = Some(Credentials {
                        access_token: grant.access_token,
                        refresh_token: grant.refresh_token.unwrap_or(refresh_token),
                        expires_at: now_millis() + grant.expires_in * 1000,
                    });
                }
                self.persist_sessions(inner);
                Some(access_token)
            }
            Err(e) => {
                log::warn!(
                    "[Room] Credential refresh failed for {}: {} - dropping credentials",
                    session_id,
                    e
                );
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(session) = inner.sessions.get_mut(session_id) {
                    session.credentials = None;
                }
                if inner.conductor_id.as_deref() == Some(session_id) {
                    inner.conductor_id = inner
                        .sessions
                        .first_with_credentials()
                        .map(|s| s.id.clone());
                    self.broadcast_mode(inner);
                }
                self.persist_sessions(inner);
                None
            }
        }
    }

    /// Commands play on one session's player, notifying it when no
    /// device is active. Failures never abort the surrounding operation.
    pub(crate) async fn play_for_session(
        &self,
        session_id: String,
        uris: Vec<String>,
        position_ms: Option<u64>,
    ) {
        let spotify = Arc::clone(&self.spotify);
        let call_uris = uris.clone();
        let result = self
            .with_session_token(&session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                let uris = call_uris.clone();
                Box::pin(async move { spotify.play(&token, &uris, position_ms).await })
            })
            .await;

        match result {
            Ok(()) => {}
            Err(SpotifyError::NoActiveDevice) => {
                let inner = self.inner.lock();
                if let Some(session) = inner.sessions.get(&session_id) {
                    Self::send_to(
                        session,
                        OutboundMessage::ProminentMessage {
                            message: "No active player found. Open your Spotify player and try again."
                                .into(),
                        },
                    );
                }
            }
            Err(e) => {
                log::warn!("[Room] Play failed for session {}: {}", session_id, e);
            }
        }
    }

    async fn pause_for_session(&self, session_id: String) {
        let spotify = Arc::clone(&self.spotify);
        let result = self
            .with_session_token(&session_id, move |token| {
                let spotify = Arc::clone(&spotify);
                Box::pin(async move { spotify.pause(&token).await })
            })
            .await;

        if let Err(e) = result {
            log::warn!("[Room] Pause failed for session {}: {}", session_id, e);
        }
    }

    /// Assigns a new current track, arms the playback-failure watch, and
    /// commands every mirroring player. The track is NOT consumed from
    /// its queue tier until the provider confirms it playing.
    pub(crate) async fn set_and_start(&self, actor: Option<String>, track: Track, is_fallback: bool) {
        let players = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let now = now_millis();

            let started_by = actor.or_else(|| {
                inner
                    .conductor_id
                    .as_deref()
                    .and_then(|id| inner.sessions.get(id))
                    .map(Session::display_name)
            });

            inner.current = Some(track.clone());
            inner.current_is_fallback = is_fallback;
            inner.current_consumed = false;
            inner.current_started_by = started_by;
            inner.expected = Some(ExpectedPlayback {
                uri: track.uri.clone(),
                is_fallback,
                deadline_ms: now + FAILURE_WINDOW_MS,
            });
            inner.last_commanded_ms = now;
            inner.mode = PlaybackMode::Playing;

            Self::broadcast_tracks(inner);
            self.broadcast_mode(inner);
            Self::broadcast_all(
                inner,
                OutboundMessage::PlayTrack {
                    track: track.clone(),
                },
            );

            inner.sessions.followers()
        };

        log::info!(
            "[Room] Starting {} on {} player(s)",
            track.uri,
            players.len()
        );

        let uris = vec![track.uri.clone()];
        join_all(
            players
                .into_iter()
                .map(|(sid, _)| self.play_for_session(sid, uris.clone(), None)),
        )
        .await;
    }

    /// Nominates the next track via peek, or pauses the room when both
    /// tiers are empty.
    pub(crate) async fn start_next(&self, actor: Option<String>) {
        let next = {
            let inner = self.inner.lock();
            inner
                .queue
                .peek_next()
                .map(|(track, is_fallback)| (track.clone(), is_fallback))
        };

        match next {
            Some((track, is_fallback)) => {
                self.set_and_start(actor, track, is_fallback).await;
            }
            None => {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                inner.mode = PlaybackMode::Paused;
                inner.expected = None;
                self.broadcast_mode(inner);
                log::info!("[Room] Queue exhausted, pausing");
            }
        }
    }

    /// Pushes the outgoing current track into the play history.
    pub(crate) fn finish_current(&self, inner: &mut RoomInner) {
        if let Some(track) = inner.current.take() {
            let started_by = inner
                .current_started_by
                .take()
                .unwrap_or_else(|| "the room".into());
            inner.play_history.push(PlayedTrack {
                timestamp: now_millis(),
                track,
                started_by,
            });
            Self::broadcast_play_history(inner);
        }
        inner.current_consumed = false;
        inner.current_is_fallback = false;
    }

    /// Sources the fallback queue from the configured playlist when it is
    /// empty; rate limited so a broken playlist is not hammered.
    pub(crate) async fn ensure_fallback(&self) {
        {
            let mut inner = self.inner.lock();
            let now = now_millis();
            if !inner.queue.fallback().is_empty() {
                return;
            }
            if now < inner.fallback_last_attempt_ms + FALLBACK_RETRY_MS {
                return;
            }
            inner.fallback_last_attempt_ms = now;
        }

        let Some(parsed) = parse_resource(&self.config.fallback_playlist) else {
            log::warn!(
                "[Room] Configured fallback playlist is not parseable: {}",
                self.config.fallback_playlist
            );
            return;
        };
        if parsed.kind != ResourceKind::Playlist {
            log::warn!("[Room] Configured fallback is not a playlist: {}", parsed.uri);
            return;
        }

        if let Err(e) = self.replace_fallback(&parsed.id).await {
            log::warn!("[Room] Could not source fallback queue: {}", e);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Startup, periodic maintenance, shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Loads persisted state: sessions first (refreshing credentials and
    /// dropping the unrefreshable), then the queue (backfilling missing
    /// album art via the conductor's credentials), then history. Finally
    /// sources the fallback queue.
    pub async fn startup_load(&self) {
        // Sessions
        let persisted = self.store.load_sessions();
        let count = persisted.len();
        for record in persisted {
            let session: Session = record.into();
            let session_id = session.id.clone();
            {
                let mut inner = self.inner.lock();
                inner.sessions.insert(session);
            }
            if self.refresh_session_credentials(&session_id).await.is_none() {
                log::warn!("[Room] Dropping persisted session {} (refresh failed)", session_id);
                let mut inner = self.inner.lock();
                inner.sessions.remove(&session_id);
            }
        }
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.conductor_id.is_none() {
                if let Some(candidate) = inner.sessions.first_with_credentials() {
                    inner.conductor_id = Some(candidate.id.clone());
                    inner.needs_adoption = true;
                    log::info!("[Room] Conductor restored: {}", candidate.id);
                }
            }
            self.persist_sessions(inner);
            log::info!(
                "[Room] Restored {}/{} persisted session(s)",
                inner.sessions.len(),
                count
            );
        }

        // Queue, with album art migration
        let tracks = self.store.load_queue();
        let metadata = self.metadata_session().ok();
        let mut restored = Vec::with_capacity(tracks.len());
        for mut track in tracks {
            if track.album_art_url.is_none() {
                if let (Some((session_id, _)), Some(id)) =
                    (&metadata, track.uri.rsplit(':').next().map(str::to_string))
                {
                    let spotify = Arc::clone(&self.spotify);
                    let result = self
                        .with_session_token(session_id, move |token| {
                            let spotify = Arc::clone(&spotify);
                            let id = id.clone();
                            Box::pin(async move { spotify.track_info(&token, &id).await })
                        })
                        .await;
                    match result {
                        Ok(info) => track.album_art_url = info.album_art_url,
                        Err(e) => {
                            log::debug!("[Room] Album art backfill failed for {}: {}", track.uri, e)
                        }
                    }
                }
            }
            restored.push(track);
        }
        {
            let mut inner = self.inner.lock();
            log::info!("[Room] Restored queue with {} track(s)", restored.len());
            inner.queue = TrackQueue::from_tracks(restored);
        }

        // History
        let events = self.store.load_history();
        {
            let mut inner = self.inner.lock();
            inner.history = HistoryLedger::from_events(events);
        }

        self.ensure_fallback().await;
    }

    /// Refreshes every provider-capable session and re-persists the set.
    pub async fn refresh_all_credentials(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .iter()
                .filter(|s| s.has_credentials())
                .map(|s| s.id.clone())
                .collect()
        };

        log::info!("[Room] Refreshing credentials for {} session(s)", ids.len());
        for id in ids {
            self.refresh_session_credentials(&id).await;
        }

        let inner = self.inner.lock();
        self.persist_sessions(&inner);
    }

    /// Writes all three state files; used on shutdown.
    pub fn persist_all(&self) {
        let inner = self.inner.lock();
        self.persist_queue(&inner);
        self.persist_sessions(&inner);
        self.store.save_history(&inner.history.all());
    }
}
