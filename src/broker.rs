//! Session Broker (C6): accepts viewer sessions, replays cached results,
//! then hands over to the live bus without gap or duplicate, and relays
//! a handful of control messages back to the Task Controller.
//!
//! Grounded in the corpus's `fixes_live_websocket` shape (split
//! read/write tasks around a `flume` channel pair, `tokio::select!` to
//! tear down when any side ends) but the transport split lives in
//! `web.rs`; this module is the transport-agnostic session state
//! machine so it can be tested without an actual WebSocket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::TileResult;
use crate::config::Config;
use crate::controller::TaskController;
use crate::model::{SubtileKey, SubtileRecord, Source, TaskId, TaskStatus};
use crate::region::Grid;
use crate::schedule::build_schedule;

/// Server -> client wire messages. Tagged by `type`, matching the
/// external interface's JSON shape exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    GridInfo {
        task_id: TaskId,
        grid_y: u32,
        grid_x: u32,
        levels: u32,
        total_subtiles: u64,
    },
    SnapshotReady {
        task_id: TaskId,
        level: u32,
        url: String,
    },
    Tile {
        task_id: TaskId,
        level: u32,
        coarse_row: u32,
        coarse_col: u32,
        sub_row: u32,
        sub_col: u32,
        subtiles_per_side: u32,
        elevation: Option<f64>,
        source: Source,
        sampled_at: DateTime<Utc>,
    },
    Progress {
        completed: u64,
        total: u64,
        positive: u64,
    },
    Heartbeat {
        server_time: DateTime<Utc>,
    },
    Done {
        task_id: TaskId,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Client -> server wire messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    StartTask {
        task_id: Option<TaskId>,
        #[serde(default)]
        config: Option<Value>,
    },
    PauseTask {
        task_id: TaskId,
    },
    StopTask {
        task_id: TaskId,
    },
    GetStatus {
        task_id: Option<TaskId>,
    },
}

impl From<&TileResult> for ServerMessage {
    fn from(result: &TileResult) -> Self {
        record_to_tile_message(&result.key, &result.record)
    }
}

fn record_to_tile_message(key: &SubtileKey, record: &SubtileRecord) -> ServerMessage {
    ServerMessage::Tile {
        task_id: key.task_id,
        level: record.level,
        coarse_row: record.coarse_row,
        coarse_col: record.coarse_col,
        sub_row: record.sub_row,
        sub_col: record.sub_col,
        subtiles_per_side: record.subtiles_per_side,
        elevation: record.elevation,
        source: record.source,
        sampled_at: record.sampled_at,
    }
}

/// Timing knobs for one session, resolved once from `Config` at connect
/// time so later config reloads don't change a session mid-flight.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub slow_timeout: Duration,
}

impl SessionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(config.session_idle_timeout_ms),
            slow_timeout: Duration::from_millis(config.slow_session_timeout_ms),
        }
    }
}

/// Sends one message on the outbound channel, treating a send that
/// blocks past `slow_timeout` as the session's disconnect condition —
/// the external contract's "drop only this session, never the task".
async fn send(
    outbound: &FlumeSender<ServerMessage>,
    msg: ServerMessage,
    slow_timeout: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(slow_timeout, outbound.send_async(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_elapsed) => {
            warn!("session send blocked past slow_session_timeout_ms, dropping session");
            Err(())
        }
    }
}

/// Drives one viewer session end to end: `grid_info`, snapshot prefetch,
/// cache replay, live handover, heartbeats, idle timeout, and dispatch
/// of client control messages to the `TaskController`. Returns once the
/// session ends, for any reason (client disconnect, slow consumer, task
/// done, idle timeout).
pub async fn run_session(
    controller: Arc<TaskController>,
    task_id: TaskId,
    limits: SessionLimits,
    outbound: FlumeSender<ServerMessage>,
    inbound: FlumeReceiver<ClientMessage>,
) {
    let task = match controller.get_task(task_id).await {
        Ok(task) => task,
        Err(err) => {
            let _ = send(
                &outbound,
                ServerMessage::Error {
                    code: "invalid_config".into(),
                    message: err.to_string(),
                },
                limits.slow_timeout,
            )
            .await;
            return;
        }
    };

    let total_subtiles = task.total_subtiles();
    if send(
        &outbound,
        ServerMessage::GridInfo {
            task_id,
            grid_y: task.grid.rows,
            grid_x: task.grid.cols,
            levels: task.levels,
            total_subtiles,
        },
        limits.slow_timeout,
    )
    .await
    .is_err()
    {
        return;
    }

    // Snapshot fallback: kick off a background render of the coarsest
    // level (the URL is announced immediately; the GET route renders it
    // on demand too, so the prefetch only saves the first viewer a wait).
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.get_or_render_snapshot(task_id, 0).await {
                debug!(%task_id, %err, "background snapshot prefetch failed");
            }
        });
        let url = format!("/tasks/{task_id}/snapshot/0");
        if send(
            &outbound,
            ServerMessage::SnapshotReady { task_id, level: 0, url },
            limits.slow_timeout,
        )
        .await
        .is_err()
        {
            return;
        }
    }

    // Subscribe before the replay walk starts, not after: the walk can
    // take arbitrarily long (network-bound cache backends, large
    // schedules), and any write published strictly between a "miss" on a
    // given key and the subscribe call would otherwise be lost forever —
    // already passed over by replay, and too late for live delivery.
    // Subscribing first means the bounded channel buffers everything
    // published from here on, so the live-handover loop below can still
    // dedupe against `emitted`/`high_water_mark` without gaps.
    let mut bus_rx = controller.bus().subscribe();

    // Replay: walk the schedule order, emitting a `tile` message for
    // every key already durable in the cache. Bounded-channel backpressure
    // on `outbound` is what paces replay to the session's drain rate.
    let schedule = build_schedule(task_id, task.grid, task.levels);
    let mut emitted: HashSet<SubtileKey> = HashSet::with_capacity(schedule.len());
    let mut high_water_mark: Option<DateTime<Utc>> = None;

    for key in &schedule {
        match controller.cache().get(key).await {
            Ok(Some(record)) => {
                high_water_mark = Some(match high_water_mark {
                    Some(existing) if existing >= record.sampled_at => existing,
                    _ => record.sampled_at,
                });
                if send(&outbound, record_to_tile_message(key, &record), limits.slow_timeout)
                    .await
                    .is_err()
                {
                    return;
                }
                emitted.insert(*key);
            }
            Ok(None) => {}
            Err(err) => {
                debug!(%err, "replay: cache read failed, treating as absent");
            }
        }
    }

    // Live handover: drop any bus message already covered by replay or
    // earlier than the high-water mark — this is what keeps the switch
    // gap/dup free, now that `bus_rx` has been subscribed since before
    // replay started.
    let mut heartbeat = tokio::time::interval(limits.heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately; consume it

    let mut last_activity = tokio::time::Instant::now();
    let mut done_sent = false;

    loop {
        if tokio::time::Instant::now().duration_since(last_activity) > limits.idle_timeout {
            info!(%task_id, "session idle timeout, closing");
            return;
        }

        tokio::select! {
            biased;

            recv = bus_rx.recv() => {
                match recv {
                    Ok(result) => {
                        if result.key.task_id != task_id {
                            continue;
                        }
                        if emitted.contains(&result.key) {
                            continue;
                        }
                        if let Some(mark) = high_water_mark
                            && result.record.sampled_at < mark
                        {
                            continue;
                        }
                        emitted.insert(result.key);
                        if send(&outbound, ServerMessage::from(&result), limits.slow_timeout)
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%task_id, skipped, "session lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return;
                    }
                }
            }

            msg = inbound.recv_async() => {
                let Ok(msg) = msg else { return };
                last_activity = tokio::time::Instant::now();
                if !handle_client_message(&controller, task_id, msg, &outbound, limits.slow_timeout).await {
                    return;
                }
            }

            _ = heartbeat.tick() => {
                if send(&outbound, ServerMessage::Heartbeat { server_time: Utc::now() }, limits.slow_timeout)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        if !done_sent
            && let Ok(status) = controller.status(task_id).await
        {
            if send(
                &outbound,
                ServerMessage::Progress {
                    completed: status.counters.completed,
                    total: status.counters.scheduled,
                    positive: status.counters.positive,
                },
                limits.slow_timeout,
            )
            .await
            .is_err()
            {
                return;
            }
            if matches!(status.status, TaskStatus::Completed) {
                done_sent = true;
                if send(&outbound, ServerMessage::Done { task_id }, limits.slow_timeout)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Dispatches one client control message. Returns `false` if the session
/// should close (protocol error).
async fn handle_client_message(
    controller: &TaskController,
    session_task_id: TaskId,
    msg: ClientMessage,
    outbound: &FlumeSender<ServerMessage>,
    slow_timeout: Duration,
) -> bool {
    match msg {
        ClientMessage::Ping => send(outbound, ServerMessage::Heartbeat { server_time: Utc::now() }, slow_timeout)
            .await
            .is_ok(),
        ClientMessage::Pong => true,
        ClientMessage::StartTask { task_id, .. } => {
            let target = task_id.unwrap_or(session_task_id);
            dispatch(controller.start(target).await, outbound, slow_timeout).await
        }
        ClientMessage::PauseTask { task_id } => {
            dispatch(controller.pause(task_id).await, outbound, slow_timeout).await
        }
        ClientMessage::StopTask { task_id } => {
            dispatch(controller.stop(task_id).await, outbound, slow_timeout).await
        }
        ClientMessage::GetStatus { task_id } => {
            let target = task_id.unwrap_or(session_task_id);
            match controller.status(target).await {
                Ok(status) => send(
                    outbound,
                    ServerMessage::Progress {
                        completed: status.counters.completed,
                        total: status.counters.scheduled,
                        positive: status.counters.positive,
                    },
                    slow_timeout,
                )
                .await
                .is_ok(),
                Err(err) => send(
                    outbound,
                    ServerMessage::Error { code: "invalid_config".into(), message: err.to_string() },
                    slow_timeout,
                )
                .await
                .is_ok(),
            }
        }
    }
}

async fn dispatch(
    result: Result<(), crate::error::ScanError>,
    outbound: &FlumeSender<ServerMessage>,
    slow_timeout: Duration,
) -> bool {
    if let Err(err) = result {
        return send(
            outbound,
            ServerMessage::Error { code: "invalid_config".into(), message: err.to_string() },
            slow_timeout,
        )
        .await
        .is_ok();
    }
    true
}
