//! Client channel: the per-session duplex WebSocket endpoint.
//!
//! Attach: `GET /ws?sessionId=...&projectId=...` (session and project fields
//! are camelCase on the wire; everything inside event frames is snake_case).
//! Inbound frames carry either a chat `message` or `approvals` decisions;
//! anything else is ignored so future frame kinds stay compatible.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use liveosc::LiveBridge;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentLoop;
use crate::events::SessionEvent;
use crate::indexer;
use crate::sessions::{SessionRegistry, SessionState};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub agent: Arc<AgentLoop>,
    pub bridge: Arc<LiveBridge>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachQuery {
    session_id: String,
    #[serde(default)]
    project_id: Option<String>,
}

/// Inbound frame. Exactly one of the known fields is acted on; unknown
/// fields and unknown frame kinds are ignored, not errored.
#[derive(Debug, Default, Deserialize)]
struct ClientFrame {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    approvals: Option<HashMap<String, bool>>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AttachQuery>,
    State(state): State<AppState>,
) -> Response {
    let project_id = match query.project_id.filter(|p| !p.is_empty()) {
        Some(project_id) => project_id,
        None => return (StatusCode::BAD_REQUEST, "no project selected").into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id, project_id))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    project_id: String,
) {
    let (session, created) = state.registry.get_or_create(&session_id, &project_id);
    info!(
        "session {}: channel open ({})",
        session.id,
        if created { "new" } else { "reconnect" }
    );

    // Subscribe before kicking off indexing so no progress event is missed.
    let mut events = session.subscribe();
    let cancel = CancellationToken::new();

    // DAW-side error notifications are surfaced on the channel, not just
    // logged.
    let mut daw_errors = state
        .bridge
        .transport()
        .subscribe(liveosc::transport::ERROR_ADDR);
    let error_session = session.clone();
    let error_task = tokio::spawn(async move {
        while let Some(args) = daw_errors.recv().await {
            error_session.emit(SessionEvent::Error {
                message: format!("DAW error: {:?}", args),
            });
        }
    });

    if session.mirror.is_indexed() {
        session.emit(SessionEvent::IndexingStatus {
            is_indexing: false,
            progress: Some(100),
        });
    } else {
        tokio::spawn(indexer::run(session.clone(), state.bridge.clone()));
    }

    let (mut sink, mut inbound) = socket.split();

    let out_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("slow client dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &session, &cancel, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("session {}: receive error: {}", session.id, e);
                break;
            }
        }
    }

    // Disconnect: abort the in-flight turn. Observer subscriptions, history,
    // and pending debounce timers stay - the session outlives the channel.
    cancel.cancel();
    out_task.abort();
    error_task.abort();
    info!("session {}: channel closed", session.id);
}

fn handle_frame(
    state: &AppState,
    session: &Arc<SessionState>,
    cancel: &CancellationToken,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("session {}: ignoring malformed frame: {}", session.id, e);
            return;
        }
    };

    if let Some(message) = frame.message {
        let agent = state.agent.clone();
        let session = session.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            agent.run_turn(session, message, cancel).await;
        });
    } else if let Some(approvals) = frame.approvals {
        if !session.resolve_approvals(approvals) {
            warn!(
                "session {}: approvals matched no pending request",
                session.id
            );
        }
    } else {
        debug!("session {}: ignoring frame with no known field", session.id);
    }
}
