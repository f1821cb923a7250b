use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    /// Identity the session delivers for. Customers and transporters share
    /// the same socket surface.
    pub user: Uuid,
}

/// Client frames. Subscribing with `last_seq` replays everything newer from
/// the job's buffer; without it the session only sees events from now on.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
enum ClientFrame {
    Subscribe {
        job_id: Uuid,
        last_seq: Option<u64>,
    },
    Unsubscribe {
        job_id: Uuid,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (session_id, event_rx) = state.sessions.register(user_id);
    state
        .metrics
        .live_sessions
        .set(state.sessions.live_count() as i64);

    info!(user_id = %user_id, session_id = %session_id, "websocket client connected");

    let mut event_stream = UnboundedReceiverStream::new(event_rx);
    let send_task = tokio::spawn(async move {
        while let Some(event) = event_stream.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else {
                continue;
            };

            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { job_id, last_seq }) => {
                    handle_subscribe(&recv_state, user_id, session_id, job_id, last_seq);
                }
                Ok(ClientFrame::Unsubscribe { job_id }) => {
                    recv_state.fanout.unsubscribe(user_id, job_id);
                }
                Err(err) => {
                    debug!(error = %err, "ignoring malformed ws frame");
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.sessions.unregister(session_id);
    state
        .metrics
        .live_sessions
        .set(state.sessions.live_count() as i64);
    info!(user_id = %user_id, session_id = %session_id, "websocket client disconnected");
}

/// Subscriptions are limited to the job's parties and transporters it was
/// offered to. Replay goes to this session only; other sessions of the same
/// user already received the live events.
fn handle_subscribe(
    state: &AppState,
    user_id: Uuid,
    session_id: Uuid,
    job_id: Uuid,
    last_seq: Option<u64>,
) {
    let authorized = match state.store.get(job_id) {
        Ok(job) => job.is_party(user_id) || state.fanout.is_subscribed(user_id, job_id),
        Err(_) => false,
    };
    if !authorized {
        debug!(user_id = %user_id, job_id = %job_id, "subscribe refused");
        return;
    }

    state.fanout.subscribe(user_id, job_id);

    if let Some(last_seq) = last_seq {
        for event in state.fanout.replay_since(job_id, last_seq) {
            state.sessions.send_to_session(session_id, event);
        }
    }
}
