// crates/server/src/routes/mux.rs
//! Mux lifecycle endpoints and the terminal WebSocket.
//!
//! - `GET    /api/mux`                    -- list mux sessions
//! - `POST   /api/sessions/{id}/join`     -- attach-or-create for a session
//! - `POST   /api/sessions/{id}/inject`   -- send text without attaching
//! - `DELETE /api/mux/{name}`             -- terminate a mux session
//! - `WS     /api/mux/{name}/attach`      -- bidirectional byte pipe

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    response::{Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mux", get(list_mux))
        .route("/api/mux/{name}", delete(terminate_mux))
        .route("/api/mux/{name}/attach", get(ws_attach))
        .route("/api/sessions/{id}/join", post(join_session))
        .route("/api/sessions/{id}/inject", post(inject_session))
}

/// GET /api/mux
async fn list_mux(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let sessions = state.mux.list().await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

/// POST /api/sessions/{id}/join
async fn join_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.mux.join(&id).await?;
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct InjectBody {
    text: String,
}

/// POST /api/sessions/{id}/inject -- text goes to the session's mux; the
/// caller supplies any trailing newline.
async fn inject_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InjectBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.text.is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    let mux_name = state.mux.mux_name_for(&id);
    state.mux.inject(&mux_name, &body.text).await?;
    Ok(Json(serde_json::json!({ "injected": true, "mux_name": mux_name })))
}

/// DELETE /api/mux/{name}
async fn terminate_mux(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.mux.terminate(&name).await?;
    Ok(Json(serde_json::json!({ "terminated": true })))
}

#[derive(Debug, Deserialize)]
struct AttachQuery {
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_cols")]
    cols: u16,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

/// Resize control frame, sent as a text message on the same socket.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    cols: Option<u16>,
}

/// WS /api/mux/{name}/attach?rows=24&cols=80
async fn ws_attach(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(size): Query<AttachQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_attach(state, name, size, socket))
}

async fn handle_attach(state: Arc<AppState>, name: String, size: AttachQuery, mut socket: WebSocket) {
    let pipe = match state.mux.attach(&name, size.rows, size.cols).await {
        Ok(pipe) => pipe,
        Err(e) => {
            let err = serde_json::json!({ "type": "error", "message": e.to_string() });
            let _ = socket.send(Message::Text(err.to_string().into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let (mut output, handle) = pipe.split();

    tracing::info!(mux = %name, rows = size.rows, cols = size.cols, "terminal attached");

    // Protocol-level pings keep half-dead TCP connections from lingering.
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            chunk = output.recv() => {
                match chunk {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Attach process ended; tell the client and stop.
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        if !handle.write(bytes.to_vec()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Resize frames ride the same channel; anything else
                        // is terminal input.
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(frame) if frame.frame_type == "resize" => {
                                if let (Some(rows), Some(cols)) = (frame.rows, frame.cols) {
                                    if let Err(e) = handle.resize(rows, cols) {
                                        tracing::warn!(mux = %name, error = %e, "resize failed");
                                    }
                                }
                            }
                            _ => {
                                if !handle.write(text.as_bytes().to_vec()).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping `handle` kills the local attach process; the mux session
    // itself stays alive for the next client.
    tracing::info!(mux = %name, "terminal detached");
}
