//! WebSocket handler for the persistent bidirectional channel.
//!
//! The first inbound frame must be a `login` carrying the session id;
//! anything else closes the connection with `login_error`. After login,
//! inbound frames are dispatched to the room service and outbound
//! messages are drained from the session's outbox channel.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde::Deserialize;

use crate::api::AppState;
use crate::broadcast::{self, Outbox, OutboundMessage};
use crate::error::ChorusResult;

/// How long a fresh connection may take to send its login frame.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the connection-level idle check.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Inbound message types
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming WebSocket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsIncoming {
    #[serde(rename_all = "camelCase")]
    Login { session_id: String },
    GetTracks,
    GetSessions,
    GetPlayHistory,
    Ping,
    RemoveTrack {
        uri: String,
    },
    DelayTrack {
        uri: String,
    },
    Jam {
        uri: String,
        #[serde(default)]
        unjam: bool,
    },
    MasterPlay,
    MasterPause,
    MasterSkip,
    StartFallback,
    SessionPlay,
    SessionPause,
    Airhorn {
        name: String,
    },
    TakeMasterControl,
    HistoryMessage {
        message: String,
    },
}

fn to_ws_message(message: &OutboundMessage) -> Option<Message> {
    serde_json::to_string(message)
        .ok()
        .map(|s| Message::Text(s.into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection handling
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Reads the mandatory first frame; `None` for anything but a login.
async fn await_login(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    let frame = tokio::time::timeout(LOGIN_TIMEOUT, receiver.next())
        .await
        .ok()??
        .ok()?;

    let Message::Text(text) = frame else {
        return None;
    };
    match serde_json::from_str::<WsIncoming>(&text) {
        Ok(WsIncoming::Login { session_id }) => Some(session_id),
        _ => None,
    }
}

async fn send_login_error(sender: &mut SplitSink<WebSocket, Message>, message: &str) {
    let outbound = OutboundMessage::LoginError {
        message: message.to_string(),
    };
    if let Some(frame) = to_ws_message(&outbound) {
        let _ = sender.send(frame).await;
    }
    let _ = sender.close().await;
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(session_id) = await_login(&mut receiver).await else {
        log::warn!("[WS] Connection closed: no login frame");
        send_login_error(&mut sender, "expected a login message").await;
        return;
    };

    let (outbox, mut rx) = broadcast::channel();
    if let Err(e) = state.room.login(&session_id, outbox.clone()) {
        log::warn!("[WS] Login rejected for {}: {}", session_id, e);
        send_login_error(&mut sender, &e.to_string()).await;
        return;
    }

    log::info!("[WS] Session {} connected", session_id);

    let idle_timeout = Duration::from_millis(state.config.heartbeat_timeout_ms);
    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(IDLE_CHECK_INTERVAL);
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Inbound frames from the participant
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(incoming) => {
                                dispatch(&state, &session_id, &outbox, incoming).await;
                            }
                            Err(_) => {} // Unknown message type, ignore
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            // Outbound messages from the room
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        let evicted = matches!(message, OutboundMessage::LoginError { .. });
                        if let Some(frame) = to_ws_message(&message) {
                            if sender.send(frame).await.is_err() {
                                break;
                            }
                        }
                        // An eviction notice ends this connection
                        if evicted {
                            break;
                        }
                    }
                    // The session was removed; its outbox is gone
                    None => break,
                }
            }
            // Connection-level idle check (authoritative eviction is the
            // room's stale sweep; this just frees the socket)
            _ = idle_check.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    log::warn!("[WS] Session {} idle, closing socket", session_id);
                    break;
                }
            }
        }
    }

    // Close this connection's channel before detaching so the room can
    // tell it apart from a replacement transport.
    drop(rx);
    state.room.detach(&session_id);
    log::info!("[WS] Session {} disconnected", session_id);
}

/// Routes one inbound message to the room service. Operation failures
/// are surfaced to the caller only, on the same channel.
async fn dispatch(state: &AppState, session_id: &str, outbox: &Outbox, incoming: WsIncoming) {
    let room = &state.room;
    match incoming {
        // Repeated logins on an attached connection are ignored
        WsIncoming::Login { .. } => {}

        WsIncoming::Ping => {
            if room.heartbeat(session_id) {
                let _ = outbox.send(OutboundMessage::Pong);
            }
        }

        WsIncoming::GetTracks => {
            let _ = outbox.send(room.tracks_message());
        }
        WsIncoming::GetSessions => {
            let _ = outbox.send(room.sessions_message());
        }
        WsIncoming::GetPlayHistory => {
            let _ = outbox.send(room.play_history_message());
        }

        WsIncoming::RemoveTrack { uri } => report(outbox, room.remove_track(&uri)),
        WsIncoming::DelayTrack { uri } => room.delay_track(&uri),
        WsIncoming::Jam { uri, unjam } => report(outbox, room.jam(session_id, &uri, unjam)),

        WsIncoming::MasterPlay => report(outbox, room.master_play(session_id).await),
        WsIncoming::MasterPause => report(outbox, room.master_pause(session_id).await),
        WsIncoming::MasterSkip => report(outbox, room.master_skip(session_id).await),
        WsIncoming::StartFallback => report(outbox, room.start_fallback(session_id).await),

        WsIncoming::SessionPlay => report(outbox, room.session_play(session_id).await),
        WsIncoming::SessionPause => report(outbox, room.session_pause(session_id)),

        WsIncoming::Airhorn { name } => report(outbox, room.airhorn(session_id, &name)),
        WsIncoming::TakeMasterControl => report(outbox, room.take_master_control(session_id)),
        WsIncoming::HistoryMessage { message } => {
            report(outbox, room.history_message(session_id, &message));
        }
    }
}

/// Sends a failed operation's error back to the initiating session.
fn report(outbox: &Outbox, result: ChorusResult<()>) {
    if let Err(e) = result {
        let _ = outbox.send(OutboundMessage::ProminentMessage {
            message: e.to_string(),
        });
    }
}
