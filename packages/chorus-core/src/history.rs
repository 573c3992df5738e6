//! Ring-buffered room history.
//!
//! The ledger keeps the most recent 500 events (the persisted set) and
//! broadcasts the most recent 100; the play history keeps the last 100
//! completed plays.

use std::collections::VecDeque;

use crate::model::{HistoryEvent, PlayedTrack};

/// Maximum events retained (and persisted).
pub const HISTORY_CAP: usize = 500;

/// Events included in a `history` broadcast.
pub const HISTORY_BROADCAST: usize = 100;

/// Maximum completed plays retained.
pub const PLAY_HISTORY_CAP: usize = 100;

/// Append-only, ring-trimmed event history.
#[derive(Debug, Default)]
pub struct HistoryLedger {
    events: VecDeque<HistoryEvent>,
}

impl HistoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a persisted ledger, trimming oversized input.
    #[must_use]
    pub fn from_events(events: Vec<HistoryEvent>) -> Self {
        let mut ledger = Self {
            events: events.into(),
        };
        ledger.trim();
        ledger
    }

    /// Appends an event and trims to the cap.
    pub fn push(&mut self, event: HistoryEvent) {
        self.events.push_back(event);
        self.trim();
    }

    fn trim(&mut self) {
        while self.events.len() > HISTORY_CAP {
            self.events.pop_front();
        }
    }

    /// The broadcast view: most recent [`HISTORY_BROADCAST`] events,
    /// oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<HistoryEvent> {
        let skip = self.events.len().saturating_sub(HISTORY_BROADCAST);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// The full retained set, for persistence.
    #[must_use]
    pub fn all(&self) -> Vec<HistoryEvent> {
        self.events.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Ring of the most recent completed plays.
#[derive(Debug, Default)]
pub struct PlayHistory {
    entries: VecDeque<PlayedTrack>,
}

impl PlayHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PlayedTrack) {
        self.entries.push_back(entry);
        while self.entries.len() > PLAY_HISTORY_CAP {
            self.entries.pop_front();
        }
    }

    /// Most recent plays, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<PlayedTrack> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
