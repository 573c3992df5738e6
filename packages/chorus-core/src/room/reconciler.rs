//! The playback reconciliation loop.
//!
//! A single periodic task polls the conductor's real player and compares
//! it to the room's intended state. Each tick may confirm a nominated
//! track, detect track-end, detect drift (including the conductor
//! skipping ahead on their own), detect a playback failure, or interpret
//! an observed pause as user intent.
//!
//! Ticks are strictly sequential: the body is awaited before the next
//! interval fire, and missed ticks are delayed rather than burst.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Room, RoomInner, GRACE_WINDOW_MS};
use crate::broadcast::OutboundMessage;
use crate::model::{HistoryEvent, HistoryKind, PlaybackMode, Track, TrackProgress};
use crate::spotify::PlaybackSnapshot;
use crate::utils::now_millis;

/// Fraction of a track's duration that must have elapsed before a
/// URI change or progress reset counts as the track ending.
const TRACK_END_FRACTION: f64 = 0.9;

/// Period of the stale-session sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Period of the background credential refresh.
const CREDENTIAL_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// What a tick decided needs to happen outside the lock.
#[derive(Debug)]
pub(crate) enum TickDirective {
    /// Nominate the next track (or pause when both tiers are empty).
    StartNext,
    /// Command the conductor's player back to the intended track.
    Correct { uri: String },
}

/// True when the previous and current snapshots show a finished track:
/// either the same track with its progress reset to zero, or a switch to
/// a different track, both after more than 90% had played.
pub(crate) fn track_ended(prev: &PlaybackSnapshot, current: &PlaybackSnapshot) -> bool {
    let Some(prev_uri) = prev.uri.as_deref() else {
        return false;
    };
    if prev.duration_ms == 0 {
        return false;
    }
    let near_end = prev.progress_ms as f64 > TRACK_END_FRACTION * prev.duration_ms as f64;
    if !near_end {
        return false;
    }

    match current.uri.as_deref() {
        Some(uri) if uri == prev_uri => current.progress_ms == 0,
        Some(_) => true,
        None => false,
    }
}

/// True when a snapshot sits at (or past) 100% progress.
pub(crate) fn at_full_progress(snapshot: &PlaybackSnapshot) -> bool {
    snapshot.duration_ms > 0 && snapshot.progress_ms >= snapshot.duration_ms
}

impl Room {
    /// One reconciliation tick. A no-op while the room is paused, except
    /// for the one-time adoption of a fresh conductor's observable state.
    pub async fn tick(&self) {
        let needs_adoption = {
            let inner = self.inner.lock();
            inner.needs_adoption && inner.current.is_none()
        };
        if needs_adoption {
            self.adopt_current().await;
        }

        let conductor = {
            let inner = self.inner.lock();
            if inner.mode != PlaybackMode::Playing {
                return;
            }
            inner.conductor_token()
        };
        let Some((conductor_id, _)) = conductor else {
            return;
        };

        let spotify = Arc::clone(&self.spotify);
        let result = self
            .with_session_token(&conductor_id, move |token| {
                let spotify = Arc::clone(&spotify);
                Box::pin(async move { spotify.current_playback(&token).await })
            })
            .await;

        let snapshot = match result {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => PlaybackSnapshot::idle(),
            Err(e) if e.is_transient() => {
                log::debug!("[Reconcile] Transient poll failure: {}", e);
                return;
            }
            Err(e) => {
                log::warn!("[Reconcile] Poll failed: {}", e);
                return;
            }
        };

        let directive = {
            let mut guard = self.inner.lock();
            self.observe(&mut guard, snapshot)
        };

        match directive {
            Some(TickDirective::StartNext) => {
                let exhausted = {
                    let inner = self.inner.lock();
                    inner.queue.exhausted()
                };
                if exhausted {
                    self.ensure_fallback().await;
                }
                self.start_next(None).await;
            }
            Some(TickDirective::Correct { uri }) => {
                log::info!("[Reconcile] Correcting drift back to {}", uri);
                self.play_for_session(conductor_id, vec![uri], None).await;
            }
            None => {}
        }
    }

    /// Applies one playback snapshot to the room state. Runs entirely
    /// under the room lock; provider commands are returned as a directive.
    fn observe(&self, inner: &mut RoomInner, snapshot: PlaybackSnapshot) -> Option<TickDirective> {
        let now = now_millis();
        if self.config.debug {
            log::debug!(
                "[Reconcile] observed uri={:?} progress={}/{}ms playing={}",
                snapshot.uri,
                snapshot.progress_ms,
                snapshot.duration_ms,
                snapshot.is_playing
            );
        }

        // Playback-failure watch: a nominated track must be observed
        // playing before its deadline.
        if let Some(expected) = inner.expected.clone() {
            let confirmed =
                snapshot.is_playing && snapshot.uri.as_deref() == Some(expected.uri.as_str());

            if confirmed {
                inner.expected = None;
                if !inner.current_consumed {
                    inner
                        .queue
                        .consume_confirmed(&expected.uri, expected.is_fallback);
                    inner.current_consumed = true;

                    if let Some(track) = inner.current.clone() {
                        let kind = if expected.is_fallback {
                            HistoryKind::FallbackPlay
                        } else {
                            HistoryKind::TrackPlay
                        };
                        let actor = inner
                            .current_started_by
                            .clone()
                            .unwrap_or_else(|| "the room".into());
                        self.append_history(
                            inner,
                            HistoryEvent::for_track(kind, &actor, "", &track),
                        );
                    }

                    Self::broadcast_tracks(inner);
                    self.persist_queue(inner);
                    log::info!("[Reconcile] Confirmed playback of {}", expected.uri);
                }
                self.update_progress(inner, &snapshot);
                inner.last_snapshot = Some(snapshot);
                return None;
            }

            if now >= expected.deadline_ms {
                log::warn!(
                    "[Reconcile] {} was not observed playing within the failure window",
                    expected.uri
                );
                inner.expected = None;
                inner.current = None;
                inner.current_consumed = false;
                inner.current_started_by = None;
                Self::broadcast_all(
                    inner,
                    OutboundMessage::PlaybackError {
                        message: "Playback could not be started on the conductor's player".into(),
                    },
                );
                self.broadcast_mode(inner);
                inner.last_snapshot = Some(snapshot);
                return Some(TickDirective::StartNext);
            }

            // Still inside the window: keep waiting, reinterpret nothing
            inner.last_snapshot = Some(snapshot);
            return None;
        }

        // Unidentifiable playback (nothing playing, local file, private
        // session): never advance, never correct. A fully stopped player
        // outside the grace window is the conductor pausing.
        let Some(observed_uri) = snapshot.uri.clone() else {
            if inner.mode == PlaybackMode::Playing && !snapshot.is_playing && !inner.in_grace(now) {
                inner.mode = PlaybackMode::Paused;
                self.broadcast_mode(inner);
                log::info!("[Reconcile] Conductor playback stopped, pausing room");
            }
            inner.last_snapshot = Some(snapshot);
            return None;
        };

        // Playing with no current track: nominate the next one
        let Some(current) = inner.current.clone() else {
            inner.last_snapshot = Some(snapshot);
            return Some(TickDirective::StartNext);
        };

        let prev = inner.last_snapshot.clone();

        // Track-end detection; exactly-at-100% counts as ended, not paused
        let ended_by_transition = prev.as_ref().is_some_and(|p| track_ended(p, &snapshot));
        let ended_at_boundary = observed_uri == current.uri && at_full_progress(&snapshot);
        if ended_by_transition || ended_at_boundary {
            log::info!("[Reconcile] Track ended: {}", current.uri);
            self.finish_current(inner);
            inner.last_snapshot = Some(snapshot);
            return Some(TickDirective::StartNext);
        }

        // Drift: the conductor is playing something other than intended
        if observed_uri != current.uri {
            if inner.in_grace(now) {
                inner.last_snapshot = Some(snapshot);
                return None;
            }

            if inner.queue.find(&observed_uri).is_some() {
                // Natural advance: the conductor moved ahead to a queued
                // track on their own; splice it out and adopt it.
                let mut advanced = inner
                    .queue
                    .remove(&observed_uri)
                    .expect("presence checked above");
                log::info!("[Reconcile] Conductor advanced to queued track {}", advanced.uri);
                self.finish_current(inner);
                advanced.progress = Some(TrackProgress {
                    position_ms: snapshot.progress_ms,
                    duration_ms: snapshot.duration_ms,
                });

                let after_manual_skip =
                    now < inner.last_manual_skip_ms.saturating_add(GRACE_WINDOW_MS);
                if !after_manual_skip {
                    let actor = inner.conductor_name().unwrap_or_else(|| "the room".into());
                    self.append_history(
                        inner,
                        HistoryEvent::for_track(HistoryKind::TrackPlay, &actor, "", &advanced),
                    );
                }

                inner.current_started_by = inner.conductor_name();
                inner.current = Some(advanced);
                inner.current_is_fallback = false;
                inner.current_consumed = true;

                Self::broadcast_tracks(inner);
                self.broadcast_mode(inner);
                self.persist_queue(inner);
                inner.last_snapshot = Some(snapshot);
                return None;
            }

            // Off-queue track: command the intended one back
            inner.last_commanded_ms = now;
            inner.last_snapshot = Some(snapshot);
            return Some(TickDirective::Correct { uri: current.uri });
        }

        // Observed pause on the intended track is user intent (outside
        // grace, and never at the very end of the track)
        if let Some(prev) = &prev {
            if prev.is_playing
                && !snapshot.is_playing
                && !inner.in_grace(now)
                && !at_full_progress(&snapshot)
            {
                inner.mode = PlaybackMode::Paused;
                self.broadcast_mode(inner);
                log::info!("[Reconcile] Conductor paused, pausing room");
                inner.last_snapshot = Some(snapshot);
                return None;
            }
        }

        self.update_progress(inner, &snapshot);
        inner.last_snapshot = Some(snapshot);
        None
    }

    fn update_progress(&self, inner: &mut RoomInner, snapshot: &PlaybackSnapshot) {
        if let Some(track) = inner.current.as_mut() {
            track.progress = Some(TrackProgress {
                position_ms: snapshot.progress_ms,
                duration_ms: snapshot.duration_ms,
            });
        }
        self.broadcast_mode(inner);
    }

    /// Adopts a freshly elected conductor's real playback as the room's
    /// current state (observable initial state).
    pub(crate) async fn adopt_current(&self) {
        let conductor = {
            let inner = self.inner.lock();
            inner.conductor_token()
        };
        let Some((conductor_id, _)) = conductor else {
            self.inner.lock().needs_adoption = false;
            return;
        };

        let spotify = Arc::clone(&self.spotify);
        let result = self
            .with_session_token(&conductor_id, move |token| {
                let spotify = Arc::clone(&spotify);
                Box::pin(async move { spotify.current_playback(&token).await })
            })
            .await;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::debug!("[Reconcile] Adoption poll failed: {} - will retry", e);
                return;
            }
        };

        let Some(snapshot) = snapshot else {
            self.inner.lock().needs_adoption = false;
            return;
        };
        let Some(uri) = snapshot.uri.clone() else {
            let mut inner = self.inner.lock();
            inner.needs_adoption = false;
            inner.last_snapshot = Some(snapshot);
            return;
        };

        let track_id = uri
            .rsplit(':')
            .next()
            .map(str::to_string)
            .unwrap_or_default();
        let spotify = Arc::clone(&self.spotify);
        let info = self
            .with_session_token(&conductor_id, move |token| {
                let spotify = Arc::clone(&spotify);
                let id = track_id.clone();
                Box::pin(async move { spotify.track_info(&token, &id).await })
            })
            .await;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.needs_adoption = false;
        if inner.current.is_some() {
            return;
        }

        match info {
            Ok(info) => {
                let mut track = Track::from_info(info, None, None);
                track.progress = Some(TrackProgress {
                    position_ms: snapshot.progress_ms,
                    duration_ms: snapshot.duration_ms,
                });
                inner.current = Some(track);
                inner.current_is_fallback = false;
                inner.current_consumed = true;
                inner.current_started_by = inner.conductor_name();
                inner.mode = if snapshot.is_playing {
                    PlaybackMode::Playing
                } else {
                    PlaybackMode::Paused
                };
                inner.last_snapshot = Some(snapshot);
                log::info!("[Reconcile] Adopted conductor playback: {}", uri);
                self.broadcast_mode(inner);
            }
            Err(e) => {
                log::warn!("[Reconcile] Could not fetch adopted track metadata: {}", e);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Spawns the reconciliation loop. Ticks at the configured period, plus
/// immediately whenever the room nudges it.
pub fn spawn_reconciler(
    room: Arc<Room>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "[Reconcile] Loop started ({}ms period)",
            poll_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[Reconcile] Shutting down");
                    break;
                }
                _ = room.tick_nudge.notified() => room.tick().await,
                _ = interval.tick() => room.tick().await,
            }
        }
    })
}

/// Spawns the stale-session sweep.
pub fn spawn_cleanup(room: Arc<Room>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => room.cleanup_stale(),
            }
        }
    })
}

/// Spawns the periodic credential refresh.
pub fn spawn_credential_refresh(room: Arc<Room>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(CREDENTIAL_REFRESH_INTERVAL) => {
                    room.refresh_all_credentials().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::model::{Credentials, Session};
    use crate::persist::StateStore;
    use crate::spotify::{
        PlaylistInfo, SpotifyApi, SpotifyError, SpotifyResult, TokenGrant, TrackInfo, UserProfile,
    };
    use crate::state::Config;

    // ─────────────────────────────────────────────────────────────────────
    // Scripted provider
    // ─────────────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct MockSpotify {
        snapshots: Mutex<VecDeque<Option<PlaybackSnapshot>>>,
        plays: Mutex<Vec<Vec<String>>>,
        pauses: Mutex<usize>,
        play_failure: Mutex<Option<fn() -> SpotifyError>>,
    }

    impl MockSpotify {
        fn push_snapshot(&self, snapshot: Option<PlaybackSnapshot>) {
            self.snapshots.lock().push_back(snapshot);
        }

        fn fail_plays_with(&self, f: fn() -> SpotifyError) {
            *self.play_failure.lock() = Some(f);
        }

        fn played_uris(&self) -> Vec<Vec<String>> {
            self.plays.lock().clone()
        }
    }

    fn mock_info(id: &str) -> TrackInfo {
        TrackInfo {
            uri: format!("spotify:track:{id}"),
            name: format!("Track {id}"),
            artist: "Artist".into(),
            album: "Album".into(),
            album_art_url: Some("http://art".into()),
            duration_ms: Some(200_000),
        }
    }

    #[async_trait]
    impl SpotifyApi for MockSpotify {
        async fn track_info(&self, _token: &str, id: &str) -> SpotifyResult<TrackInfo> {
            Ok(mock_info(id))
        }

        async fn playlist_info(&self, _token: &str, _id: &str) -> SpotifyResult<PlaylistInfo> {
            Err(SpotifyError::NotFound)
        }

        async fn playlist_tracks(&self, _token: &str, _id: &str) -> SpotifyResult<Vec<TrackInfo>> {
            Err(SpotifyError::NotFound)
        }

        async fn play(
            &self,
            _token: &str,
            uris: &[String],
            _position_ms: Option<u64>,
        ) -> SpotifyResult<()> {
            if let Some(failure) = *self.play_failure.lock() {
                return Err(failure());
            }
            self.plays.lock().push(uris.to_vec());
            Ok(())
        }

        async fn pause(&self, _token: &str) -> SpotifyResult<()> {
            *self.pauses.lock() += 1;
            Ok(())
        }

        async fn current_playback(&self, _token: &str) -> SpotifyResult<Option<PlaybackSnapshot>> {
            Ok(self.snapshots.lock().pop_front().flatten())
        }

        async fn refresh(&self, _refresh_token: &str) -> SpotifyResult<TokenGrant> {
            Ok(TokenGrant {
                access_token: "refreshed".into(),
                expires_in: 3600,
                refresh_token: None,
            })
        }

        async fn random_liked(&self, _token: &str, _count: usize) -> SpotifyResult<Vec<TrackInfo>> {
            Ok(vec![])
        }

        async fn me(&self, _token: &str) -> SpotifyResult<UserProfile> {
            Ok(UserProfile {
                display_name: "Mock".into(),
                email: "mock@x.com".into(),
            })
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fixtures
    // ─────────────────────────────────────────────────────────────────────

    fn test_room(mock: Arc<MockSpotify>) -> Room {
        Room::new(
            mock,
            StateStore::disabled(),
            Arc::new(Config::default()),
        )
    }

    fn provider_session(id: &str, email: &str) -> Session {
        let mut session = Session::listener(id.to_string(), format!("name-{id}"), email.to_string());
        session.credentials = Some(Credentials {
            access_token: format!("token-{id}"),
            refresh_token: format!("refresh-{id}"),
            expires_at: now_millis() + 3_600_000,
        });
        session
    }

    fn user_track(uri: &str, email: &str) -> Track {
        Track::from_info(
            TrackInfo {
                uri: uri.to_string(),
                name: "Song".into(),
                artist: "Artist".into(),
                album: "Album".into(),
                album_art_url: None,
                duration_ms: Some(200_000),
            },
            Some("Submitter".into()),
            Some(email.to_string()),
        )
    }

    fn snap(uri: &str, progress_ms: u64, duration_ms: u64, is_playing: bool) -> PlaybackSnapshot {
        PlaybackSnapshot {
            uri: Some(uri.to_string()),
            progress_ms,
            duration_ms,
            is_playing,
        }
    }

    /// Installs a conductor session and makes the room think the last
    /// commanded change is long past (out of grace).
    fn install_conductor(room: &Room, session_id: &str) {
        let mut inner = room.inner.lock();
        inner
            .sessions
            .insert(provider_session(session_id, &format!("{session_id}@x.com")));
        inner.conductor_id = Some(session_id.to_string());
        inner.needs_adoption = false;
    }

    fn out_of_grace(room: &Room) {
        let mut inner = room.inner.lock();
        inner.last_commanded_ms = 0;
        inner.last_manual_skip_ms = 0;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pure detection helpers
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn track_end_on_progress_reset_near_end() {
        let prev = snap("spotify:track:x", 190_000, 200_000, true);
        let current = snap("spotify:track:x", 0, 200_000, true);
        assert!(track_ended(&prev, &current));
    }

    #[test]
    fn track_end_on_uri_change_near_end() {
        let prev = snap("spotify:track:x", 185_000, 200_000, true);
        let current = snap("spotify:track:y", 2_000, 180_000, true);
        assert!(track_ended(&prev, &current));
    }

    #[test]
    fn no_track_end_mid_song() {
        let prev = snap("spotify:track:x", 50_000, 200_000, true);
        assert!(!track_ended(&prev, &snap("spotify:track:x", 0, 200_000, true)));
        assert!(!track_ended(&prev, &snap("spotify:track:y", 0, 200_000, true)));
    }

    #[test]
    fn no_track_end_without_previous_uri() {
        let prev = PlaybackSnapshot::idle();
        assert!(!track_ended(&prev, &snap("spotify:track:x", 0, 200_000, true)));
    }

    #[test]
    fn full_progress_boundary() {
        assert!(at_full_progress(&snap("spotify:track:x", 200_000, 200_000, false)));
        assert!(!at_full_progress(&snap("spotify:track:x", 199_999, 200_000, false)));
        assert!(!at_full_progress(&PlaybackSnapshot::idle()));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scenarios
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn nominated_track_is_consumed_only_on_confirmation() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.queue.add(user_track("spotify:track:x", "a@x.com")).unwrap();
        }

        room.master_play("s1").await.unwrap();

        // Nominated and commanded, but not yet consumed
        {
            let inner = room.inner.lock();
            assert_eq!(inner.mode, PlaybackMode::Playing);
            assert_eq!(inner.queue.len(), 1);
            assert_eq!(
                inner.current.as_ref().map(|t| t.uri.as_str()),
                Some("spotify:track:x")
            );
            assert!(!inner.current_consumed);
            assert!(inner.expected.is_some());
        }
        assert_eq!(mock.played_uris(), vec![vec!["spotify:track:x".to_string()]]);

        // Poll confirms the track is playing: consume it
        mock.push_snapshot(Some(snap("spotify:track:x", 1_000, 200_000, true)));
        room.tick().await;

        let inner = room.inner.lock();
        assert_eq!(inner.queue.len(), 0);
        assert!(inner.current_consumed);
        assert!(inner.expected.is_none());
        assert!(inner
            .history
            .recent()
            .iter()
            .any(|e| e.kind == HistoryKind::TrackPlay));
    }

    #[tokio::test]
    async fn failed_nomination_keeps_queue_and_emits_error() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        // Attach an observer transport to catch the error broadcast
        let (tx, mut rx) = crate::broadcast::channel();
        {
            let mut inner = room.inner.lock();
            inner.queue.add(user_track("spotify:track:x", "a@x.com")).unwrap();
            let session = inner.sessions.get_mut("s1").unwrap();
            session.outbox = Some(tx);
        }

        room.master_play("s1").await.unwrap();

        // Expire the failure window, observing some other track
        {
            let mut inner = room.inner.lock();
            inner.expected.as_mut().unwrap().deadline_ms = now_millis() - 1;
        }
        mock.push_snapshot(Some(snap("spotify:track:other", 10_000, 180_000, true)));
        room.tick().await;

        // Queue unchanged: the submission was never consumed
        {
            let inner = room.inner.lock();
            assert_eq!(inner.queue.len(), 1);
        }

        let mut saw_error = false;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, OutboundMessage::PlaybackError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn natural_advance_splices_queued_track() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.current_started_by = Some("Submitter".into());
            inner.mode = PlaybackMode::Playing;
            inner.queue.add(user_track("spotify:track:y", "b@x.com")).unwrap();
            inner.queue.add(user_track("spotify:track:z", "c@x.com")).unwrap();
            inner.last_snapshot = Some(snap("spotify:track:x", 50_000, 200_000, true));
        }
        out_of_grace(&room);

        // The conductor skipped ahead to Y on their own player
        mock.push_snapshot(Some(snap("spotify:track:y", 5_000, 200_000, true)));
        room.tick().await;

        let inner = room.inner.lock();
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:y")
        );
        assert!(inner.current_consumed);
        assert_eq!(inner.queue.len(), 1);
        assert_eq!(inner.queue.tracks()[0].uri, "spotify:track:z");

        // X went to play history; Y got a track_play entry
        let plays = inner.play_history.recent();
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].track.uri, "spotify:track:x");
        assert!(inner
            .history
            .recent()
            .iter()
            .any(|e| e.kind == HistoryKind::TrackPlay
                && e.track.as_ref().is_some_and(|t| t.uri == "spotify:track:y")));
        // No provider command was issued: the conductor already plays Y
        assert!(mock.played_uris().is_empty());
    }

    #[tokio::test]
    async fn drift_within_manual_skip_grace_is_deferred() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.queue.add(user_track("spotify:track:y", "b@x.com")).unwrap();
            inner.last_snapshot = Some(snap("spotify:track:x", 50_000, 200_000, true));
            inner.last_commanded_ms = 0;
            inner.last_manual_skip_ms = now_millis();
        }

        mock.push_snapshot(Some(snap("spotify:track:y", 5_000, 200_000, true)));
        room.tick().await;

        let inner = room.inner.lock();
        // A manual skip keeps the grace window open, so the drift path
        // defers entirely; nothing changes until the window passes.
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:x")
        );
        assert_eq!(inner.queue.len(), 1);
    }

    #[tokio::test]
    async fn track_end_advances_to_next_nomination() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.queue.add(user_track("spotify:track:y", "b@x.com")).unwrap();
            inner.last_snapshot = Some(snap("spotify:track:x", 195_000, 200_000, true));
        }
        out_of_grace(&room);

        // Progress reset to zero after >90% played: the track ended
        mock.push_snapshot(Some(snap("spotify:track:x", 0, 200_000, true)));
        room.tick().await;

        let inner = room.inner.lock();
        // X pushed to play history, Y nominated (not yet consumed)
        assert_eq!(inner.play_history.recent()[0].track.uri, "spotify:track:x");
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:y")
        );
        assert!(!inner.current_consumed);
        assert!(inner.expected.is_some());
        assert_eq!(inner.queue.len(), 1);
        // And the nomination was commanded to the players
        assert_eq!(mock.played_uris(), vec![vec!["spotify:track:y".to_string()]]);
    }

    #[tokio::test]
    async fn empty_queues_while_playing_transition_to_paused() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.mode = PlaybackMode::Playing;
            // prevent fallback sourcing attempts during the test
            inner.fallback_last_attempt_ms = now_millis();
        }
        out_of_grace(&room);

        mock.push_snapshot(Some(snap("spotify:track:w", 1_000, 100_000, true)));
        room.tick().await;

        let inner = room.inner.lock();
        assert_eq!(inner.mode, PlaybackMode::Paused);
        assert!(inner.current.is_none());
    }

    #[tokio::test]
    async fn pause_within_grace_window_is_ignored() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.last_snapshot = Some(snap("spotify:track:x", 10_000, 200_000, true));
            inner.last_commanded_ms = now_millis();
        }

        mock.push_snapshot(Some(snap("spotify:track:x", 12_000, 200_000, false)));
        room.tick().await;

        assert_eq!(room.inner.lock().mode, PlaybackMode::Playing);
    }

    #[tokio::test]
    async fn pause_outside_grace_window_flips_mode() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.last_snapshot = Some(snap("spotify:track:x", 10_000, 200_000, true));
        }
        out_of_grace(&room);

        mock.push_snapshot(Some(snap("spotify:track:x", 12_000, 200_000, false)));
        room.tick().await;

        assert_eq!(room.inner.lock().mode, PlaybackMode::Paused);
    }

    #[tokio::test]
    async fn pause_at_full_progress_is_track_end_not_pause() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.queue.add(user_track("spotify:track:y", "b@x.com")).unwrap();
            inner.last_snapshot = Some(snap("spotify:track:x", 199_000, 200_000, true));
        }
        out_of_grace(&room);

        mock.push_snapshot(Some(snap("spotify:track:x", 200_000, 200_000, false)));
        room.tick().await;

        let inner = room.inner.lock();
        // Ended, and the next track was nominated (room stays playing)
        assert_eq!(inner.mode, PlaybackMode::Playing);
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:y")
        );
    }

    #[tokio::test]
    async fn drift_to_unqueued_track_commands_correction() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.last_snapshot = Some(snap("spotify:track:x", 10_000, 200_000, true));
        }
        out_of_grace(&room);

        mock.push_snapshot(Some(snap("spotify:track:rogue", 3_000, 150_000, true)));
        room.tick().await;

        // The loop commanded the intended track back
        assert_eq!(mock.played_uris(), vec![vec!["spotify:track:x".to_string()]]);
        let inner = room.inner.lock();
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:x")
        );
    }

    #[tokio::test]
    async fn unidentifiable_playback_is_observer_blind() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        {
            let mut inner = room.inner.lock();
            inner.current = Some(user_track("spotify:track:x", "a@x.com"));
            inner.current_consumed = true;
            inner.mode = PlaybackMode::Playing;
            inner.queue.add(user_track("spotify:track:y", "b@x.com")).unwrap();
            inner.last_snapshot = Some(snap("spotify:track:x", 10_000, 200_000, true));
        }
        out_of_grace(&room);

        // Private session / local file: uri is unknown but audio plays
        mock.push_snapshot(Some(PlaybackSnapshot {
            uri: None,
            progress_ms: 42_000,
            duration_ms: 180_000,
            is_playing: true,
        }));
        room.tick().await;

        let inner = room.inner.lock();
        // Neither advanced nor corrected
        assert_eq!(
            inner.current.as_ref().map(|t| t.uri.as_str()),
            Some("spotify:track:x")
        );
        assert_eq!(inner.queue.len(), 1);
        assert_eq!(inner.mode, PlaybackMode::Playing);
        assert!(mock.played_uris().is_empty());
    }

    #[tokio::test]
    async fn no_active_device_notifies_only_that_session() {
        let mock = Arc::new(MockSpotify::default());
        mock.fail_plays_with(|| SpotifyError::NoActiveDevice);
        let room = test_room(Arc::clone(&mock));
        install_conductor(&room, "s1");

        let (tx, mut rx) = crate::broadcast::channel();
        {
            let mut inner = room.inner.lock();
            inner.queue.add(user_track("spotify:track:x", "a@x.com")).unwrap();
            inner.sessions.get_mut("s1").unwrap().outbox = Some(tx);
        }

        room.master_play("s1").await.unwrap();

        let mut saw_prominent = false;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, OutboundMessage::ProminentMessage { .. }) {
                saw_prominent = true;
            }
        }
        assert!(saw_prominent);
    }

    #[test]
    fn duplicate_email_login_transfers_conductor() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(mock);

        {
            let mut inner = room.inner.lock();
            inner.sessions.insert(provider_session("s1", "dj@x.com"));
            inner.sessions.insert(provider_session("s2", "dj@x.com"));
            inner.conductor_id = Some("s1".to_string());
        }

        let (tx, _rx) = crate::broadcast::channel();
        room.login("s2", tx).unwrap();

        let inner = room.inner.lock();
        assert!(inner.sessions.get("s1").is_none());
        assert_eq!(inner.conductor_id.as_deref(), Some("s2"));
    }

    #[test]
    fn login_rejects_identityless_session() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(mock);
        {
            let mut inner = room.inner.lock();
            inner.sessions.insert(Session::new("s1".into()));
        }

        let (tx, _rx) = crate::broadcast::channel();
        assert!(room.login("s1", tx).is_err());
    }

    #[tokio::test]
    async fn master_controls_require_the_conductor() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(mock);
        {
            let mut inner = room.inner.lock();
            inner.sessions.insert(provider_session("s1", "dj@x.com"));
            inner.sessions.insert(provider_session("s2", "other@x.com"));
            inner.conductor_id = Some("s1".to_string());
        }

        assert!(room.master_play("s2").await.is_err());
        assert!(room.master_pause("s2").await.is_err());
        assert!(room.master_skip("s2").await.is_err());
        assert!(room.master_pause("s1").await.is_ok());
    }

    #[tokio::test]
    async fn fallback_promotion_by_jam() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(mock);

        {
            let mut inner = room.inner.lock();
            inner.sessions.insert(provider_session("s1", "fan@x.com"));
            inner.queue.add(user_track("spotify:track:u1", "a@x.com")).unwrap();
            inner.queue.add(user_track("spotify:track:u2", "b@x.com")).unwrap();
            let fallback: Vec<Track> = (0..8)
                .map(|i| {
                    Track::from_fallback(
                        TrackInfo {
                            uri: format!("spotify:track:f{i}"),
                            name: format!("F{i}"),
                            artist: "Artist".into(),
                            album: "Album".into(),
                            album_art_url: None,
                            duration_ms: None,
                        },
                        "Mix",
                    )
                })
                .collect();
            inner.queue.set_fallback(fallback);
            assert_eq!(inner.queue.display().len(), 10);
        }

        room.jam("s1", "spotify:track:f3", false).unwrap();

        let inner = room.inner.lock();
        let promoted = inner.queue.find("spotify:track:f3").unwrap();
        assert_eq!(promoted.added_by_email.as_deref(), Some("fan@x.com"));
        assert_eq!(promoted.jam_counts.get("fan@x.com"), Some(&1));
        assert!(promoted.spotify_name.is_none());
        assert!(inner.queue.find_fallback("spotify:track:f3").is_none());
        // One fewer fallback entry in the display
        assert_eq!(
            inner
                .queue
                .display()
                .iter()
                .filter(|e| e.is_fallback)
                .count(),
            7
        );
    }

    #[tokio::test]
    async fn jam_on_current_track_never_promotes() {
        let mock = Arc::new(MockSpotify::default());
        let room = test_room(mock);

        {
            let mut inner = room.inner.lock();
            inner.sessions.insert(provider_session("s1", "fan@x.com"));
            let fallback_track = Track::from_fallback(
                TrackInfo {
                    uri: "spotify:track:f0".into(),
                    name: "F0".into(),
                    artist: "Artist".into(),
                    album: "Album".into(),
                    album_art_url: None,
                    duration_ms: None,
                },
                "Mix",
            );
            inner.queue.set_fallback(vec![fallback_track.clone()]);
            inner.current = Some(fallback_track);
            inner.current_is_fallback = true;
        }

        room.jam("s1", "spotify:track:f0", false).unwrap();

        let inner = room.inner.lock();
        // Still a fallback entry; only the playing copy gained the jam
        assert!(inner.queue.find_fallback("spotify:track:f0").is_some());
        assert!(inner.queue.find("spotify:track:f0").is_none());
        assert_eq!(
            inner
                .current
                .as_ref()
                .unwrap()
                .jam_counts
                .get("fan@x.com"),
            Some(&1)
        );
    }
}
