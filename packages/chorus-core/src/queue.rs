//! The two-tier track queue: fair-inserted user submissions backed by a
//! shuffled fallback playlist.
//!
//! The queue is a plain data structure; it is only ever touched inside the
//! room's serialized mutation section. Nomination and removal are split
//! (`peek_next` / `consume_next`) so a failed provider command never loses
//! a submission.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::thread_rng;
use thiserror::Error;

use crate::model::{QueueEntry, Track};

/// Total entries shown to clients: user queue first, padded with fallback.
pub const DISPLAY_LIMIT: usize = 10;

/// Errors produced by queue mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The track is already waiting in the user queue.
    #[error("track is already in the queue: {0}")]
    Duplicate(String),
}

/// The user-submitted queue plus its fallback tier.
#[derive(Debug, Default)]
pub struct TrackQueue {
    tracks: Vec<Track>,
    fallback: Vec<Track>,
}

impl TrackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a persisted user queue.
    #[must_use]
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            fallback: Vec::new(),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn fallback(&self) -> &[Track] {
        &self.fallback
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// True when both tiers are empty.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.tracks.is_empty() && self.fallback.is_empty()
    }

    /// Inserts a user submission at its fair position.
    ///
    /// A duplicate URI in the user queue is rejected; a matching fallback
    /// entry is displaced first so the track lives in exactly one tier.
    pub fn add(&mut self, track: Track) -> Result<usize, QueueError> {
        if self.tracks.iter().any(|t| t.uri == track.uri) {
            return Err(QueueError::Duplicate(track.uri));
        }
        self.fallback.retain(|t| t.uri != track.uri);

        let index = match track.added_by_email.as_deref() {
            None => self.tracks.len(),
            Some(email) => self.fair_insert_index(email),
        };
        self.tracks.insert(index, track);
        Ok(index)
    }

    /// Computes the round-robin-fair insertion index for a submitter.
    ///
    /// Scans existing entries tracking each submitter's occurrence count;
    /// the new track lands after the last entry whose occurrence number is
    /// within the submitter's new round, and never before the submitter's
    /// own last entry.
    fn fair_insert_index(&self, email: &str) -> usize {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut last_own_idx: isize = -1;

        for (i, track) in self.tracks.iter().enumerate() {
            if let Some(e) = track.added_by_email.as_deref() {
                *counts.entry(e).or_insert(0) += 1;
                if e.eq_ignore_ascii_case(email) {
                    last_own_idx = i as isize;
                }
            }
        }

        let this_count = counts
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(email))
            .map(|(_, c)| *c)
            .unwrap_or(0);
        let new_round = this_count + 1;

        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut boundary_idx: isize = -1;
        for (i, track) in self.tracks.iter().enumerate() {
            let Some(e) = track.added_by_email.as_deref() else {
                continue;
            };
            let occurrence = seen.entry(e).or_insert(0);
            *occurrence += 1;
            if *occurrence <= new_round {
                boundary_idx = i as isize;
            }
        }

        (last_own_idx + 1).max(boundary_idx + 1) as usize
    }

    /// Removes a user-queue entry by URI.
    pub fn remove(&mut self, uri: &str) -> Option<Track> {
        let index = self.tracks.iter().position(|t| t.uri == uri)?;
        Some(self.tracks.remove(index))
    }

    /// Removes a fallback entry by URI.
    pub fn remove_fallback(&mut self, uri: &str) -> Option<Track> {
        let index = self.fallback.iter().position(|t| t.uri == uri)?;
        Some(self.fallback.remove(index))
    }

    /// Swaps an entry with its immediate successor; no-op at the tail.
    pub fn delay_one(&mut self, uri: &str) -> bool {
        let Some(index) = self.tracks.iter().position(|t| t.uri == uri) else {
            return false;
        };
        if index + 1 >= self.tracks.len() {
            return false;
        }
        self.tracks.swap(index, index + 1);
        true
    }

    /// Nominates the next track without removing it.
    #[must_use]
    pub fn peek_next(&self) -> Option<(&Track, bool)> {
        if let Some(track) = self.tracks.first() {
            return Some((track, false));
        }
        self.fallback.first().map(|track| (track, true))
    }

    /// Consumes the head of the chosen tier.
    ///
    /// Called only after the provider confirms the nominated track is
    /// actually playing.
    pub fn consume_next(&mut self, is_fallback: bool) -> Option<Track> {
        let tier = if is_fallback {
            &mut self.fallback
        } else {
            &mut self.tracks
        };
        if tier.is_empty() {
            return None;
        }
        Some(tier.remove(0))
    }

    /// Consumes a nominated track wherever it now sits in its tier.
    ///
    /// The head may have shifted between nomination and confirmation
    /// (removals, reordering); prefer the head but fall back to a URI
    /// search so the confirmed track is the one removed.
    pub fn consume_confirmed(&mut self, uri: &str, is_fallback: bool) -> Option<Track> {
        let tier = if is_fallback {
            &mut self.fallback
        } else {
            &mut self.tracks
        };
        if tier.first().is_some_and(|t| t.uri == uri) {
            return Some(tier.remove(0));
        }
        let index = tier.iter().position(|t| t.uri == uri)?;
        Some(tier.remove(index))
    }

    /// Looks up a queued user track by URI.
    #[must_use]
    pub fn find(&self, uri: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.uri == uri)
    }

    /// Looks up a fallback track by URI.
    #[must_use]
    pub fn find_fallback(&self, uri: &str) -> Option<&Track> {
        self.fallback.iter().find(|t| t.uri == uri)
    }

    /// Mutable lookup by URI in the user queue.
    pub fn find_mut(&mut self, uri: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.uri == uri)
    }

    /// Replaces the fallback tier, shuffling the given tracks.
    pub fn set_fallback(&mut self, mut tracks: Vec<Track>) {
        let mut rng = thread_rng();
        tracks.shuffle(&mut rng);
        // A track already submitted by a user stays in the user tier only
        tracks.retain(|t| !self.tracks.iter().any(|u| u.uri == t.uri));
        self.fallback = tracks;
    }

    /// Renders the client-facing view: user entries first, padded with
    /// fallback entries up to [`DISPLAY_LIMIT`] total.
    #[must_use]
    pub fn display(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .tracks
            .iter()
            .map(|track| QueueEntry {
                track: track.clone(),
                is_fallback: false,
            })
            .collect();

        if entries.len() < DISPLAY_LIMIT {
            let pad = DISPLAY_LIMIT - entries.len();
            entries.extend(self.fallback.iter().take(pad).map(|track| QueueEntry {
                track: track.clone(),
                is_fallback: true,
            }));
        }

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FALLBACK_EMAIL;
    use crate::spotify::TrackInfo;

    fn info(uri: &str) -> TrackInfo {
        TrackInfo {
            uri: uri.to_string(),
            name: format!("Song {uri}"),
            artist: "Artist".into(),
            album: "Album".into(),
            album_art_url: None,
            duration_ms: None,
        }
    }

    fn track(uri: &str, email: &str) -> Track {
        Track::from_info(
            info(uri),
            Some(email.split('@').next().unwrap().to_string()),
            Some(email.to_string()),
        )
    }

    fn fallback_track(uri: &str) -> Track {
        Track::from_fallback(info(uri), "Fallback Mix")
    }

    fn uris(queue: &TrackQueue) -> Vec<&str> {
        queue.tracks().iter().map(|t| t.uri.as_str()).collect()
    }

    #[test]
    fn duplicate_uri_is_rejected() {
        let mut queue = TrackQueue::new();
        queue.add(track("a", "u1@x.com")).unwrap();
        let err = queue.add(track("a", "u2@x.com")).unwrap_err();
        assert_eq!(err, QueueError::Duplicate("a".into()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn anonymous_submissions_append() {
        let mut queue = TrackQueue::new();
        queue.add(track("a", "u1@x.com")).unwrap();
        queue.add(track("b", "u1@x.com")).unwrap();
        let mut anonymous = Track::from_info(info("c"), None, None);
        anonymous.added_by_email = None;
        queue.add(anonymous).unwrap();
        assert_eq!(uris(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn fair_insertion_regression() {
        // Pre-state: [A1_u1, B1_u2, A2_u1, B2_u2, A3_u1]
        let mut queue = TrackQueue::from_tracks(
            [
                ("A1", "u1@x.com"),
                ("B1", "u2@x.com"),
                ("A2", "u1@x.com"),
                ("B2", "u2@x.com"),
                ("A3", "u1@x.com"),
            ]
            .into_iter()
            .map(|(u, e)| track(u, e))
            .collect(),
        );

        queue.add(track("C1", "u3@x.com")).unwrap();
        assert_eq!(uris(&queue), vec!["A1", "B1", "C1", "A2", "B2", "A3"]);

        queue.add(track("C2", "u3@x.com")).unwrap();
        assert_eq!(uris(&queue), vec!["A1", "B1", "C1", "A2", "B2", "C2", "A3"]);
    }

    #[test]
    fn five_then_one() {
        let mut queue = TrackQueue::from_tracks(
            ["A", "B", "C", "D", "E"]
                .into_iter()
                .map(|u| track(u, "u1@x.com"))
                .collect(),
        );

        queue.add(track("F", "u2@x.com")).unwrap();
        assert_eq!(uris(&queue), vec!["A", "F", "B", "C", "D", "E"]);
    }

    #[test]
    fn own_submissions_stay_in_order() {
        let mut queue = TrackQueue::new();
        queue.add(track("a", "u1@x.com")).unwrap();
        queue.add(track("b", "u1@x.com")).unwrap();
        queue.add(track("c", "u1@x.com")).unwrap();
        assert_eq!(uris(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn alternating_submissions_interleave() {
        let mut queue = TrackQueue::new();
        queue.add(track("a1", "a@x.com")).unwrap();
        queue.add(track("a2", "a@x.com")).unwrap();
        queue.add(track("b1", "b@x.com")).unwrap();
        // b1 lands after a1 (round 1) but before a2 (round 2)
        assert_eq!(uris(&queue), vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn delay_one_swaps_with_successor_and_noops_at_tail() {
        let mut queue = TrackQueue::from_tracks(
            ["a", "b", "c"]
                .into_iter()
                .map(|u| track(u, "u1@x.com"))
                .collect(),
        );

        assert!(queue.delay_one("a"));
        assert_eq!(uris(&queue), vec!["b", "a", "c"]);

        assert!(!queue.delay_one("c"));
        assert_eq!(uris(&queue), vec!["b", "a", "c"]);

        assert!(!queue.delay_one("missing"));
    }

    #[test]
    fn peek_is_stable_and_consume_removes_former_head() {
        let mut queue = TrackQueue::from_tracks(
            ["a", "b"]
                .into_iter()
                .map(|u| track(u, "u1@x.com"))
                .collect(),
        );

        let (first, is_fallback) = queue.peek_next().unwrap();
        assert_eq!(first.uri, "a");
        assert!(!is_fallback);

        // No intervening mutation: same head
        let (again, _) = queue.peek_next().unwrap();
        assert_eq!(again.uri, "a");

        let consumed = queue.consume_next(false).unwrap();
        assert_eq!(consumed.uri, "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn peek_falls_back_when_user_queue_empty() {
        let mut queue = TrackQueue::new();
        queue.set_fallback(vec![fallback_track("f1")]);

        let (track, is_fallback) = queue.peek_next().unwrap();
        assert_eq!(track.uri, "f1");
        assert!(is_fallback);
        assert_eq!(track.added_by_email.as_deref(), Some(FALLBACK_EMAIL));
    }

    #[test]
    fn consume_confirmed_survives_head_shift() {
        let mut queue = TrackQueue::from_tracks(
            ["a", "b"]
                .into_iter()
                .map(|u| track(u, "u1@x.com"))
                .collect(),
        );

        // "a" was nominated, then someone reordered it behind "b"
        queue.delay_one("a");
        let consumed = queue.consume_confirmed("a", false).unwrap();
        assert_eq!(consumed.uri, "a");
        assert_eq!(uris(&queue), vec!["b"]);
    }

    #[test]
    fn add_then_remove_restores_queue() {
        let mut queue = TrackQueue::from_tracks(
            ["a", "b"]
                .into_iter()
                .map(|u| track(u, "u1@x.com"))
                .collect(),
        );
        let before = uris(&queue)
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();

        queue.add(track("x", "u2@x.com")).unwrap();
        queue.remove("x").unwrap();
        assert_eq!(uris(&queue), before);
    }

    #[test]
    fn submitting_a_fallback_track_displaces_it() {
        let mut queue = TrackQueue::new();
        queue.set_fallback(vec![fallback_track("k"), fallback_track("f2")]);

        queue.add(track("k", "u1@x.com")).unwrap();
        assert!(queue.find_fallback("k").is_none());
        assert_eq!(queue.find("k").unwrap().added_by_email.as_deref(), Some("u1@x.com"));
    }

    #[test]
    fn display_pads_with_fallback_to_ten() {
        let mut queue = TrackQueue::new();
        queue.add(track("u1", "a@x.com")).unwrap();
        queue.add(track("u2", "b@x.com")).unwrap();
        queue.set_fallback((0..20).map(|i| fallback_track(&format!("f{i}"))).collect());

        let display = queue.display();
        assert_eq!(display.len(), DISPLAY_LIMIT);
        assert!(!display[0].is_fallback);
        assert!(!display[1].is_fallback);
        assert!(display[2..].iter().all(|e| e.is_fallback));
    }

    #[test]
    fn display_shows_full_user_queue_beyond_limit() {
        let mut queue = TrackQueue::from_tracks(
            (0..12)
                .map(|i| track(&format!("u{i}"), "a@x.com"))
                .collect(),
        );
        queue.set_fallback(vec![fallback_track("f1")]);

        let display = queue.display();
        assert_eq!(display.len(), 12);
        assert!(display.iter().all(|e| !e.is_fallback));
    }

    #[test]
    fn set_fallback_drops_tracks_already_submitted() {
        let mut queue = TrackQueue::new();
        queue.add(track("a", "u1@x.com")).unwrap();
        queue.set_fallback(vec![fallback_track("a"), fallback_track("b")]);
        assert!(queue.find_fallback("a").is_none());
        assert!(queue.find_fallback("b").is_some());
    }
}
