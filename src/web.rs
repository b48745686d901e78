//! HTTP/WebSocket surface (ambient transport layer): wires the Task
//! Controller and Session Broker behind an `axum` router.
//!
//! Grounded in the corpus's `fixes_live_websocket` shape: split the
//! socket with `socket.split()`, run one read task and one write task
//! around `flume` channels, and a third task driving the actual session
//! logic — here `broker::run_session` stands in for
//! `handle_subscriptions`. Torn down via `tokio::select!` on whichever
//! task finishes first, same as the corpus.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::broker::{self, ClientMessage, ServerMessage, SessionLimits};
use crate::controller::TaskController;
use crate::model::TaskId;
use crate::region::{Grid, Region};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TaskController>,
}

pub fn router(controller: Arc<TaskController>) -> Router {
    let state = AppState { controller };

    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{task_id}", get(get_task))
        .route("/tasks/{task_id}/start", post(start_task))
        .route("/tasks/{task_id}/pause", post(pause_task))
        .route("/tasks/{task_id}/resume", post(resume_task))
        .route("/tasks/{task_id}/stop", post(stop_task))
        .route("/tasks/{task_id}/status", get(get_status))
        .route("/tasks/{task_id}/snapshot/{level}", get(get_snapshot))
        .route("/tasks/{task_id}/ws", get(task_live_websocket))
        .route("/metrics", get(metrics_endpoint))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the router until a `ctrl_c` shutdown signal arrives,
/// draining in-flight requests and sessions cooperatively.
pub async fn start_web_server(bind_addr: &str, controller: Arc<TaskController>) -> anyhow::Result<()> {
    let app = router(controller);
    let addr: SocketAddr = bind_addr.parse()?;
    info!("starting scan service on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
    #[serde(default)]
    levels: Option<u32>,
    #[serde(default)]
    grid_y: Option<u32>,
    #[serde(default)]
    grid_x: Option<u32>,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn error_response(err: crate::error::ScanError) -> Response {
    let status = match err {
        crate::error::ScanError::InvalidConfig(_) | crate::error::ScanError::InvalidRegion(_) => {
            StatusCode::BAD_REQUEST
        }
        crate::error::ScanError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.to_string())
}

async fn create_task(State(state): State<AppState>, Json(req): Json<CreateTaskRequest>) -> Response {
    let config = state.controller.config();
    let region = Region {
        lat_min: req.lat_min,
        lat_max: req.lat_max,
        lon_min: req.lon_min,
        lon_max: req.lon_max,
    };
    let grid = Grid {
        rows: req.grid_y.unwrap_or(config.grid_y),
        cols: req.grid_x.unwrap_or(config.grid_x),
    };
    let levels = req.levels.unwrap_or(config.levels);

    match state.controller.create(region, levels, grid).await {
        Ok(task_id) => Json(json!({ "task_id": task_id })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_tasks(State(state): State<AppState>) -> Response {
    match state.controller.list().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.get_task(task_id).await {
        Ok(task) => Json(task).into_response(),
        Err(err) => error_response(err),
    }
}

async fn start_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.start(task_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err),
    }
}

async fn pause_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.pause(task_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn resume_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.resume(task_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(err),
    }
}

async fn stop_task(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.stop(task_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: crate::model::TaskStatus,
    counters: crate::model::TaskCounters,
    last_error: Option<String>,
}

async fn get_status(State(state): State<AppState>, Path(task_id): Path<TaskId>) -> Response {
    match state.controller.status(task_id).await {
        Ok(status) => Json(StatusResponse {
            status: status.status,
            counters: status.counters,
            last_error: status.last_error,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((task_id, level)): Path<(TaskId, u32)>,
) -> Response {
    match state.controller.get_or_render_snapshot(task_id, level).await {
        Ok(png) => ([("content-type", "image/png")], png).into_response(),
        Err(err) => error_response(err),
    }
}

async fn metrics_endpoint() -> Response {
    crate::metrics::metrics_handle().render().into_response()
}

/// Upgrades to a WebSocket and hands the connection to the Session
/// Broker, following the split-socket/`flume`-channel/`tokio::select!`
/// teardown pattern of `fixes_live_websocket`.
async fn task_live_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Response {
    ws.on_upgrade(move |socket| handle_task_socket(socket, state, task_id))
}

async fn handle_task_socket(socket: WebSocket, state: AppState, task_id: TaskId) {
    info!(%task_id, "scan session websocket connected");
    metrics::gauge!("scan_active_sessions").increment(1.0);

    let config = state.controller.config();
    let session_buffer = config.session_buffer;
    let slow_timeout = std::time::Duration::from_millis(config.slow_session_timeout_ms);

    let (sender, receiver) = socket.split();
    let (outbound_tx, outbound_rx) = flume::bounded::<ServerMessage>(session_buffer);
    let (inbound_tx, inbound_rx) = flume::bounded::<ClientMessage>(session_buffer);

    let read_task = tokio::spawn(handle_socket_read(receiver, inbound_tx, outbound_tx.clone()));
    let write_task = tokio::spawn(handle_socket_write(sender, outbound_rx, slow_timeout));

    let limits = SessionLimits::from_config(state.controller.config());
    let controller = state.controller.clone();
    let session_task = tokio::spawn(async move {
        broker::run_session(controller, task_id, limits, outbound_tx, inbound_rx).await;
    });

    tokio::select! {
        _ = read_task => info!(%task_id, "session read task completed"),
        _ = write_task => info!(%task_id, "session write task completed"),
        _ = session_task => info!(%task_id, "session broker completed"),
    }

    metrics::gauge!("scan_active_sessions").decrement(1.0);
    info!(%task_id, "scan session websocket closed");
}

/// `ClientProtocolError` (spec §7): a malformed client message gets an
/// `error` reply and ends the session — it never reaches the broker.
async fn handle_socket_read(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    inbound_tx: flume::Sender<ClientMessage>,
    outbound_tx: flume::Sender<ServerMessage>,
) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    if inbound_tx.send_async(client_msg).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to parse client message [{text}]");
                    let _ = outbound_tx
                        .send_async(ServerMessage::Error {
                            code: "client_protocol_error".into(),
                            message: err.to_string(),
                        })
                        .await;
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                info!("scan session websocket closed by client");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                error!(%err, "scan session websocket read error");
                break;
            }
        }
    }
}

/// Drains the outbound channel onto the real socket. `slow_timeout` bounds
/// the actual frame write, not just the channel handoff — a viewer whose
/// TCP receive buffer stops draining blocks here, not in the broker.
async fn handle_socket_write(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    outbound_rx: flume::Receiver<ServerMessage>,
    slow_timeout: std::time::Duration,
) {
    while let Ok(msg) = outbound_rx.recv_async().await {
        let payload = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(err) => {
                error!(%err, "failed to serialize server message");
                continue;
            }
        };
        match tokio::time::timeout(slow_timeout, sender.send(Message::Text(payload.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(%err, "scan session websocket write failed");
                break;
            }
            Err(_elapsed) => {
                warn!("scan session websocket write blocked past slow_session_timeout_ms, dropping session");
                metrics::counter!("scan_sessions_dropped_slow_total").increment(1);
                break;
            }
        }
    }
}
