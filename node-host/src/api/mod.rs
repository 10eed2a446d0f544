//! HTTP + WebSocket surface the UI process talks to.
//!
//! - `POST /invoke/{namespace}/{operation}` runs a boundary operation
//! - `GET /channels/{channel}` streams a channel as JSON text frames
//! - `GET /operations` lists what `invoke` accepts

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::handlers::{BoundaryHandlers, HandlerError};
use crate::session::SessionError;
use crate::state::AppState;
use crate::supervisor::SupervisorError;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/operations", get(list_operations))
        .route("/invoke/{namespace}/{operation}", post(invoke))
        .route("/channels/{channel}", get(channel_websocket))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /operations
async fn list_operations() -> impl IntoResponse {
    Json(BoundaryHandlers::operations())
}

/// POST /invoke/:namespace/:operation, body is the JSON argument array
async fn invoke(
    State(state): State<Arc<AppState>>,
    Path((namespace, operation)): Path<(String, String)>,
    Json(args): Json<Vec<Value>>,
) -> Response {
    let name = format!("{namespace}:{operation}");
    debug!(operation = %name, args = args.len(), "invoke");
    match state.handlers.dispatch(&name, &args).await {
        Ok(value) => Json(json!({ "value": value })).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(operation = %name, "invoke failed: {e}");
            } else {
                warn!(operation = %name, "invoke rejected: {e}");
            }
            (
                status,
                Json(json!({ "error": { "kind": e.kind(), "message": e.to_string() } })),
            )
                .into_response()
        }
    }
}

fn status_for(err: &HandlerError) -> StatusCode {
    match err {
        HandlerError::UnknownOperation(_)
        | HandlerError::NotFound(_)
        | HandlerError::Supervisor(SupervisorError::UnknownProcess(_)) => StatusCode::NOT_FOUND,
        HandlerError::InvalidArgument(_)
        | HandlerError::Session(SessionError::InvalidState { .. })
        | HandlerError::Session(SessionError::UnknownNetwork(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /channels/:channel: WebSocket relay of one channel
async fn channel_websocket(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_channel(socket, state, channel))
}

async fn relay_channel(socket: WebSocket, state: Arc<AppState>, channel: String) {
    let mut subscription = state.hub.subscribe(&channel);
    debug!(channel = subscription.channel(), "channel websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%channel, error = %e, "channel websocket receive error");
                    break;
                }
            },
            published = subscription.recv() => {
                let Some(message) = published else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if tx.send(Message::Text(text.into())).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%channel, "failed to encode channel message: {e}"),
                }
            }
        }
    }

    subscription.unsubscribe();
    drop(tx);
    let _ = writer.await;
    debug!(%channel, "channel websocket closed");
}
