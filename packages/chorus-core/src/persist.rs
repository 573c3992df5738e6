//! On-disk persistence of queue, sessions, and history.
//!
//! Three JSON files under a configurable data directory. Writes go
//! through a temp file + rename so a crash mid-write never leaves a
//! corrupt file; a write may lose the most recent mutation, never more.
//! All failures are logged and swallowed; persistence must not block a
//! mutation.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{HistoryEvent, PersistedSession, Track};

const QUEUE_FILE: &str = "queue.json";
const SESSIONS_FILE: &str = "sessions.json";
const HISTORY_FILE: &str = "history.json";

/// Serializes room state to a data directory; a `None` directory makes
/// every operation a no-op (in-memory only).
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: Option<PathBuf>,
}

impl StateStore {
    /// Creates a store rooted at the given directory, creating it if
    /// needed. Creation failure disables persistence rather than failing
    /// startup.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        let dir = dir.and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::warn!(
                    "[Persist] Could not create data directory {}: {} - persistence disabled",
                    dir.display(),
                    e
                );
                return None;
            }
            Some(dir)
        });
        Self { dir }
    }

    /// A store that never touches disk.
    #[must_use]
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Whether a data directory is configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn save_queue(&self, tracks: &[Track]) {
        self.save_json(QUEUE_FILE, &tracks);
    }

    #[must_use]
    pub fn load_queue(&self) -> Vec<Track> {
        self.load_json(QUEUE_FILE)
    }

    pub fn save_sessions(&self, sessions: &[PersistedSession]) {
        self.save_json(SESSIONS_FILE, &sessions);
    }

    #[must_use]
    pub fn load_sessions(&self) -> Vec<PersistedSession> {
        self.load_json(SESSIONS_FILE)
    }

    pub fn save_history(&self, events: &[HistoryEvent]) {
        self.save_json(HISTORY_FILE, &events);
    }

    #[must_use]
    pub fn load_history(&self) -> Vec<HistoryEvent> {
        self.load_json(HISTORY_FILE)
    }

    /// Writes a JSON file atomically (temp file + rename).
    fn save_json<T: Serialize>(&self, file: &str, value: &T) {
        let Some(dir) = &self.dir else {
            return;
        };

        if let Err(e) = write_atomic(dir, file, value) {
            log::warn!("[Persist] Failed to write {}: {}", file, e);
        }
    }

    /// Loads a JSON file; a missing or unreadable file yields the default.
    fn load_json<T: DeserializeOwned + Default>(&self, file: &str) -> T {
        let Some(dir) = &self.dir else {
            return T::default();
        };
        let path = dir.join(file);

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                log::warn!("[Persist] Failed to read {}: {}", path.display(), e);
                return T::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[Persist] Failed to parse {}: {}", path.display(), e);
                T::default()
            }
        }
    }
}

fn write_atomic<T: Serialize>(dir: &Path, file: &str, value: &T) -> std::io::Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    let path = dir.join(file);
    let temp_path = dir.join(format!("{file}.tmp"));

    std::fs::write(&temp_path, contents)?;
    // Atomic rename (on most filesystems)
    std::fs::rename(&temp_path, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credentials, HistoryKind, Session};
    use crate::spotify::TrackInfo;

    fn track(uri: &str) -> Track {
        Track::from_info(
            TrackInfo {
                uri: uri.to_string(),
                name: "Song".into(),
                artist: "Artist".into(),
                album: "Album".into(),
                album_art_url: Some("http://img".into()),
                duration_ms: None,
            },
            Some("Ada".into()),
            Some("a@x.com".into()),
        )
    }

    #[test]
    fn queue_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));

        let tracks = vec![track("spotify:track:a"), track("spotify:track:b")];
        store.save_queue(&tracks);

        let loaded = store.load_queue();
        assert_eq!(loaded, tracks);
    }

    #[test]
    fn sessions_round_trip_without_transport() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));

        let mut session = Session::listener("s1".into(), "Ada".into(), "a@x.com".into());
        session.credentials = Some(Credentials {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: 123,
        });

        store.save_sessions(&[session.to_persisted().unwrap()]);
        let loaded = store.load_sessions();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "s1");
        assert_eq!(loaded[0].credentials.refresh_token, "rt");
    }

    #[test]
    fn history_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));

        let events = vec![crate::model::HistoryEvent::for_actor(
            HistoryKind::Airhorn,
            "Ada",
            "a@x.com",
        )];
        store.save_history(&events);
        assert_eq!(store.load_history(), events);
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));
        assert!(store.load_queue().is_empty());
        assert!(store.load_sessions().is_empty());
        assert!(store.load_history().is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("queue.json"), "{not json").unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));
        assert!(store.load_queue().is_empty());
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = StateStore::disabled();
        assert!(!store.enabled());
        store.save_queue(&[track("spotify:track:a")]);
        assert!(store.load_queue().is_empty());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Some(dir.path().to_path_buf()));
        store.save_queue(&[track("spotify:track:a")]);
        assert!(dir.path().join("queue.json").exists());
        assert!(!dir.path().join("queue.json.tmp").exists());
    }
}
