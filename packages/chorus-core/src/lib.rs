//! Chorus Core - shared-listening room coordination.
//!
//! This crate provides the server-side coordinator for a shared-listening
//! room: one participant (the "conductor") drives a real music-provider
//! player, followers mirror the conductor's track on their own accounts,
//! listeners observe, and the server owns the queue, fairness policy,
//! reconciliation, broadcast fan-out, and persistence.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`spotify`]: Provider gateway (parsing, metadata, playback control, OAuth)
//! - [`queue`]: Fair-insertion queue with a shuffled fallback tier
//! - [`sessions`]: Participant registry with identity de-duplication
//! - [`room`]: The serialized mutation hub and the reconciliation loop
//! - [`broadcast`]: Outbound message contracts and fan-out
//! - [`history`]: Ring-buffered event and play history
//! - [`persist`]: Atomic JSON persistence of queue, sessions, and history
//! - [`api`]: HTTP routes and the WebSocket transport edge
//! - [`bootstrap`]: Composition root and background task wiring
//! - [`error`]: Centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod broadcast;
pub mod error;
pub mod history;
pub mod model;
pub mod persist;
pub mod queue;
pub mod room;
pub mod sessions;
pub mod spotify;
pub mod state;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{ChorusError, ChorusResult, ErrorCode};
pub use room::Room;
pub use state::{Config, SpotifyConfig, DEFAULT_FALLBACK_PLAYLIST};
pub use utils::now_millis;
