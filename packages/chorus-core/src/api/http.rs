//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the room service for
//! business logic.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::ChorusResult;
use crate::spotify::auth;

/// The fixed airhorn sound set clients may trigger.
const AIRHORNS: &[&str] = &["classic", "dj", "triple", "reverb", "sad-trombone"];

/// 200 with a JSON body. Failures take the [`crate::error::ChorusError`]
/// `IntoResponse` path instead, so handlers only ever shape successes.
fn ok_json(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

/// The bare acknowledgement mutation routes answer with.
fn ack() -> Response {
    ok_json(json!({ "success": true }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTrackRequest {
    input: String,
    session_id: String,
}

#[derive(Deserialize)]
struct ListenerLoginRequest {
    name: String,
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderLoginQuery {
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/submit-track", post(submit_track))
        .route("/api/listener-login", post(listener_login))
        .route("/api/session/{id}", get(session_status))
        .route("/api/master-random-liked", post(master_random_liked))
        .route("/api/airhorns", get(list_airhorns))
        .route("/login", get(provider_login))
        .route("/callback", get(oauth_callback))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe: "Is the process running?"
async fn health_check() -> Response {
    ok_json(json!({ "status": "ok", "service": "chorus" }))
}

/// Submits a track (fair-inserted) or playlist (fallback replacement).
async fn submit_track(
    State(state): State<AppState>,
    Json(payload): Json<SubmitTrackRequest>,
) -> ChorusResult<Response> {
    state
        .room
        .submit_track(&payload.session_id, &payload.input)
        .await?;
    Ok(ack())
}

/// Creates a listener-only session.
async fn listener_login(
    State(state): State<AppState>,
    Json(payload): Json<ListenerLoginRequest>,
) -> ChorusResult<Response> {
    let session_id = state.room.create_listener(&payload.name, &payload.email)?;
    Ok(ok_json(json!({ "sessionId": session_id })))
}

/// Reports whether a session id can complete a login.
async fn session_status(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    ok_json(json!({ "loggedIn": state.room.logged_in(&id) }))
}

/// Queues a few random tracks from the conductor's liked library.
async fn master_random_liked(
    State(state): State<AppState>,
    Json(payload): Json<SessionRequest>,
) -> ChorusResult<Response> {
    let added = state.room.random_liked(&payload.session_id).await?;
    Ok(ok_json(json!({ "added": added })))
}

/// Lists the available airhorn sounds.
async fn list_airhorns() -> Response {
    ok_json(json!({ "airhorns": AIRHORNS }))
}

/// Starts the provider OAuth flow. The opaque `state` round-tripped
/// through the provider is the session id.
async fn provider_login(
    State(state): State<AppState>,
    Query(query): Query<ProviderLoginQuery>,
) -> Redirect {
    let session_id = query
        .session_id
        .unwrap_or_else(|| state.room.create_session());

    let url = auth::authorize_url(&state.config.spotify, &session_id);
    Redirect::temporary(&url)
}

/// Completes the provider OAuth flow and bounces back to the front-end.
async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let frontend = state.config.frontend_url.trim_end_matches('/');

    if let Some(error) = query.error {
        log::warn!("[HTTP] OAuth denied: {}", error);
        return Redirect::temporary(&format!("{frontend}/?error={error}")).into_response();
    }

    let (Some(code), Some(session_id)) = (query.code, query.state) else {
        return Redirect::temporary(&format!("{frontend}/?error=missing_code")).into_response();
    };

    let grant = match auth::code_grant(&state.http_client, &state.config.spotify, &code).await {
        Ok(grant) => grant,
        Err(e) => {
            log::warn!("[HTTP] OAuth code grant failed: {}", e);
            return Redirect::temporary(&format!("{frontend}/?error=grant_failed"))
                .into_response();
        }
    };

    match state.room.complete_oauth(&session_id, grant).await {
        Ok(()) => {
            Redirect::temporary(&format!("{frontend}/?sessionId={session_id}")).into_response()
        }
        Err(e) => {
            log::warn!("[HTTP] OAuth completion failed: {}", e);
            Redirect::temporary(&format!("{frontend}/?error=login_failed")).into_response()
        }
    }
}
