// WebSocket transport: every upgrade request joins the room named by its
// path; every other request is answered as a liveness check.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::CONTENT_TYPE, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::room::{JoinedRoom, RoomRegistry};
use crate::sync::YrsDocument;

const DEFAULT_DOCUMENT_ID: &str = "default";
const LIVENESS_BANNER: &str = "tandem relay";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry<YrsDocument>>,
    pub metrics: Arc<RelayMetrics>,
    outbound_queue: usize,
    max_message_bytes: usize,
}

impl RelayState {
    pub fn new(config: &RelayConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(config.broadcast_policy)),
            metrics,
            outbound_queue: config.outbound_queue,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new().fallback(relay_route).with_state(state)
}

/// Maps a request path to a document id: the path minus its leading slash,
/// verbatim and case-sensitive.
pub fn document_id_from_path(path: &str) -> String {
    let id = path.strip_prefix('/').unwrap_or(path);
    if id.is_empty() {
        DEFAULT_DOCUMENT_ID.to_string()
    } else {
        id.to_string()
    }
}

async fn relay_route(
    State(state): State<RelayState>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => {
            let doc_id = document_id_from_path(uri.path());
            ws.max_message_size(state.max_message_bytes)
                .on_upgrade(move |socket| handle_socket(state, doc_id, socket))
        }
        Err(_) => liveness(&state, uri.path()),
    }
}

fn liveness(state: &RelayState, path: &str) -> Response {
    match path {
        "/healthz" => (StatusCode::OK, "ok").into_response(),
        "/metrics" => (
            StatusCode::OK,
            [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            state.metrics.render_prometheus(),
        )
            .into_response(),
        _ => (StatusCode::OK, LIVENESS_BANNER).into_response(),
    }
}

async fn handle_socket(state: RelayState, doc_id: String, mut socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::channel::<Bytes>(state.outbound_queue);
    let JoinedRoom { room, connection_id, initial_frames } =
        state.registry.join(&doc_id, outbound_sender).await;

    let mut open = true;
    for frame in initial_frames {
        if socket.send(Message::Binary(frame)).await.is_err() {
            open = false;
            break;
        }
    }

    'session: while open {
        tokio::select! {
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if socket.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        info!(doc_id = %doc_id, connection_id, "outbound queue closed, disconnecting");
                        break;
                    }
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Binary(frame)) => {
                        for reply in room.handle_frame(connection_id, &frame).await {
                            if socket.send(Message::Binary(reply)).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Text(_)) => {
                        debug!(doc_id = %doc_id, connection_id, "ignoring text frame");
                    }
                    // The transport queues the pong itself.
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Err(error) => {
                        debug!(doc_id = %doc_id, connection_id, %error, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.registry.leave(&room, connection_id).await;
}
