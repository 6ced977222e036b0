//! HTTP and WebSocket handlers.
//!
//! # Endpoints
//!
//! - `GET /jpip` - One JPIP exchange over plain HTTP (the fallback path)
//! - `GET /ws` - WebSocket upgrade carrying the binary frame protocol
//! - `GET /health` - Liveness and headline counters
//! - `GET /stats` - Engine and connection statistics

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::codestream::CodestreamSource;
use crate::error::ServerError;
use crate::geometry::Viewport;
use crate::push::{PushManager, PushManagerConfig};
use crate::request::ViewWindowRequest;
use crate::stream::tiles::{TileManager, TileManagerConfig};
use crate::transport::frame::{Frame, FrameType, ResponsePayload};

use super::connection::{
    validate_upgrade_headers, ConnectionManager, ConnectionStats, UpgradeRejection,
    JPIP_SUBPROTOCOL,
};
use super::engine::{EngineResponse, EngineStats, RequestEngine};

/// Shared handler state.
pub struct AppState<S: CodestreamSource> {
    pub engine: Arc<RequestEngine<S>>,
    pub connections: Arc<ConnectionManager>,
}

impl<S: CodestreamSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            connections: Arc::clone(&self.connections),
        }
    }
}

/// JSON error body returned for all HTTP error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// Health check response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub active_connections: usize,
    pub registered_targets: usize,
}

/// Statistics response body.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub engine: EngineStats,
    pub connections: ConnectionStats,
}

/// Build the router over the shared state.
pub fn create_router<S: CodestreamSource + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/jpip", get(jpip_handler::<S>))
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health_handler::<S>))
        .route("/stats", get(stats_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// One JPIP exchange over HTTP GET with the query-string encoding.
async fn jpip_handler<S: CodestreamSource>(
    State(state): State<AppState<S>>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let request = match ViewWindowRequest::from_query(&query) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("invalid_request", e.to_string())),
            )
                .into_response()
        }
    };

    match state.engine.handle_request(request, "http").await {
        Ok(response) => engine_response_to_http(response),
        Err(e) => server_error_response(e),
    }
}

fn engine_response_to_http(response: EngineResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn server_error_response(error: ServerError) -> Response {
    match error {
        ServerError::Throttled { retry_after_secs } => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(ErrorResponse::new("throttled", error.to_string())),
        )
            .into_response(),
        ServerError::NotRunning | ServerError::QueueFull { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("unavailable", error.to_string())),
        )
            .into_response(),
        ServerError::UnknownTarget(_) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", error.to_string())),
        )
            .into_response(),
        ServerError::NotImplemented(_) => (
            StatusCode::NOT_IMPLEMENTED,
            Json(ErrorResponse::new("not_implemented", error.to_string())),
        )
            .into_response(),
        ServerError::Protocol(_) | ServerError::Session(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_request", error.to_string())),
        )
            .into_response(),
    }
}

async fn health_handler<S: CodestreamSource>(State(state): State<AppState<S>>) -> Response {
    let engine_stats = state.engine.stats().await;
    Json(HealthResponse {
        status: "ok",
        active_sessions: engine_stats.active_sessions,
        active_connections: state.connections.len().await,
        registered_targets: engine_stats.registered_targets,
    })
    .into_response()
}

async fn stats_handler<S: CodestreamSource>(State(state): State<AppState<S>>) -> Response {
    Json(StatsResponse {
        engine: state.engine.stats().await,
        connections: state.connections.stats().await,
    })
    .into_response()
}

/// WebSocket upgrade honoring the handshake rules and connection limits.
async fn ws_handler<S: CodestreamSource + 'static>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState<S>>,
) -> Response {
    if let Err(rejection) = validate_upgrade_headers(&headers) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("bad_upgrade", rejection.message())),
        )
            .into_response();
    }

    let connection_id = match state
        .connections
        .try_register(state.engine.is_running())
        .await
    {
        Ok(id) => id,
        Err(rejection) => {
            let status = match rejection {
                UpgradeRejection::TooManyConnections
                | UpgradeRejection::ServerStopped
                | UpgradeRejection::WebSocketDisabled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            return (
                status,
                Json(ErrorResponse::new("upgrade_rejected", rejection.message())),
            )
                .into_response();
        }
    };

    ws.protocols([JPIP_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state, connection_id))
}

/// Most push frames emitted after one viewport update.
const MAX_PUSHES_PER_VIEWPORT: usize = 4;

/// Per-connection frame loop.
///
/// Each connection owns its predictive-push state: viewport history feeds
/// the prefetch engine, and predicted bins follow the response out as push
/// frames, delta-filtered against what this session already got.
async fn handle_socket<S: CodestreamSource>(
    socket: WebSocket,
    state: AppState<S>,
    connection_id: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut push = PushManager::new(PushManagerConfig::default());
    let push_tiles = TileManager::new(TileManagerConfig::default());

    while let Some(message) = ws_rx.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Text(_)) => continue,
        };
        state
            .connections
            .record_received(&connection_id, data.len() as u64)
            .await;

        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "undecodable frame");
                break;
            }
        };

        let replies = match frame.frame_type {
            FrameType::Request => {
                handle_request_frame(&state, &connection_id, &frame, &mut push, &push_tiles).await
            }
            FrameType::Ping => vec![Frame::pong(frame.payload)],
            _ => {
                debug!(frame_type = ?frame.frame_type, "ignoring frame");
                Vec::new()
            }
        };

        let mut closed = false;
        for reply in replies {
            let encoded = reply.encode();
            state
                .connections
                .record_sent(&connection_id, encoded.len() as u64)
                .await;
            if ws_tx.send(Message::Binary(encoded)).await.is_err() {
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    state.connections.remove(&connection_id).await;
}

/// Answer one request frame, then any predictive pushes it triggered.
async fn handle_request_frame<S: CodestreamSource>(
    state: &AppState<S>,
    connection_id: &str,
    frame: &Frame,
    push: &mut PushManager,
    push_tiles: &TileManager,
) -> Vec<Frame> {
    let request = match frame.decode_request() {
        Ok(request) => request,
        Err(e) => return vec![Frame::error(frame.request_id, &e.to_string())],
    };
    let viewport = request_viewport(&request);
    let target = request.target.clone();

    let mut replies = Vec::new();
    match state.engine.handle_request(request, connection_id).await {
        Ok(response) => {
            // A minted channel binds this connection to its session.
            if let Some(cnew) = response.header("JPIP-cnew") {
                if let Some(cid) = parse_cnew_cid(cnew) {
                    state.connections.bind_session(connection_id, &cid).await;
                }
            }
            let payload = ResponsePayload {
                status: response.status,
                headers: response.headers,
                body: response.body,
            };
            replies.push(Frame::response(frame.request_id, &payload));
        }
        Err(ServerError::Throttled { retry_after_secs }) => {
            let payload = ResponsePayload {
                status: 503,
                headers: vec![("Retry-After".to_string(), retry_after_secs.to_string())],
                body: bytes::Bytes::new(),
            };
            replies.push(Frame::response(frame.request_id, &payload));
            return replies;
        }
        Err(e) => {
            replies.push(Frame::error(frame.request_id, &e.to_string()));
            return replies;
        }
    }

    // Predictive push on viewport updates bound to a session.
    let (Some(viewport), Some(target)) = (viewport, target) else {
        return replies;
    };
    let Some(channel_id) = state.connections.session_of(connection_id).await else {
        return replies;
    };
    let available = state.engine.target_bins(&target).await.unwrap_or_default();
    push.on_viewport_update(&channel_id, viewport, push_tiles, &available);
    for item in push.dequeue_push_items(MAX_PUSHES_PER_VIEWPORT) {
        replies.push(Frame::push(&item.bin));
    }
    replies
}

/// The viewport a request names, when it names one.
fn request_viewport(request: &ViewWindowRequest) -> Option<Viewport> {
    let (x, y) = request.region_offset?;
    let (w, h) = request.region_size?;
    let viewport = Viewport::new(x, y, w, h, request.resolution_level.unwrap_or(0));
    viewport.is_valid().then_some(viewport)
}

/// Extract the `cid` value from a `JPIP-cnew` header, tolerating
/// whitespace around separators.
pub fn parse_cnew_cid(value: &str) -> Option<String> {
    value.split(',').find_map(|part| {
        let part = part.trim();
        let (key, val) = part.split_once('=')?;
        if key.trim() == "cid" {
            Some(val.trim().to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cnew_cid() {
        assert_eq!(
            parse_cnew_cid("cid=cid-abc,path=/jpip,transport=http"),
            Some("cid-abc".to_string())
        );
        assert_eq!(
            parse_cnew_cid("path=/jpip, cid = cid-xyz , transport=http"),
            Some("cid-xyz".to_string())
        );
        assert_eq!(parse_cnew_cid("path=/jpip"), None);
        assert_eq!(parse_cnew_cid(""), None);
    }
}
