//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where
//! the provider gateway, state store, and room service are instantiated
//! and wired together, and where the background tasks are spawned.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::error::{ChorusError, ChorusResult};
use crate::persist::StateStore;
use crate::room::reconciler::{spawn_cleanup, spawn_credential_refresh, spawn_reconciler};
use crate::room::Room;
use crate::spotify::SpotifyClientImpl;
use crate::state::Config;

/// Timeout applied to every provider HTTP request.
const REQUEST_TIMEOUT_SECS: u64 = 8;

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// The room coordinator.
    pub room: Arc<Room>,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Application configuration.
    pub config: Arc<Config>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Handles of the background tasks, if started.
    tasks: Vec<JoinHandle<()>>,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Builds the state handed to the API layer.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            room: Arc::clone(&self.room),
            http_client: self.http_client.clone(),
            config: Arc::clone(&self.config),
        }
    }

    /// Spawns the reconciliation loop, the stale-session sweep, and the
    /// periodic credential refresh. Idempotence is the caller's concern;
    /// call once.
    pub fn start_background_tasks(&mut self) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        self.tasks.push(spawn_reconciler(
            Arc::clone(&self.room),
            poll_interval,
            self.cancel_token.clone(),
        ));
        self.tasks
            .push(spawn_cleanup(Arc::clone(&self.room), self.cancel_token.clone()));
        self.tasks.push(spawn_credential_refresh(
            Arc::clone(&self.room),
            self.cancel_token.clone(),
        ));
    }

    /// Initiates graceful shutdown: stops background tasks and writes
    /// the final state files.
    pub async fn shutdown(&mut self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.room.persist_all();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client for all provider communication.
///
/// A shared client enables connection pooling; it is created once during
/// bootstrap and injected into everything that talks to the provider.
fn create_http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all application services with their dependencies and loads
/// persisted state.
///
/// Wiring order: HTTP client, provider gateway, state store, room.
/// Persisted sessions are restored (with a credential refresh) before the
/// queue so album-art backfill can use the conductor's credentials.
///
/// # Errors
///
/// Returns an error when the configuration is invalid.
pub async fn bootstrap_services(config: Config) -> ChorusResult<BootstrappedServices> {
    config
        .validate()
        .map_err(ChorusError::InvalidInput)?;
    let config = Arc::new(config);

    let http_client = create_http_client();
    let spotify = Arc::new(SpotifyClientImpl::new(
        http_client.clone(),
        config.spotify.clone(),
    ));

    let store = StateStore::new(config.data_dir.clone());
    if store.enabled() {
        log::info!(
            "[Bootstrap] Persisting state under {}",
            config
                .data_dir
                .as_ref()
                .expect("data_dir checked by enabled()")
                .display()
        );
    } else {
        log::info!("[Bootstrap] No data directory configured - state is in-memory only");
    }

    let room = Arc::new(Room::new(spotify, store, Arc::clone(&config)));
    room.startup_load().await;

    Ok(BootstrappedServices {
        room,
        http_client,
        config,
        cancel_token: CancellationToken::new(),
        tasks: Vec::new(),
    })
}
