//! Core data model: subtile keys/records, schedules, and tasks.
//!
//! `elevation` is serialized as JSON `null` when it is `NaN`, per the
//! subtile JSON schema — `Option<f64>` round-trips through serde with
//! exactly that behavior, so the wire/public type uses it directly and
//! converts to/from `f64::NAN` at the edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::region::{Grid, Region};

pub type TaskId = Uuid;

/// Totally identifies one unit of work and one cache/bus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtileKey {
    pub task_id: TaskId,
    pub level: u32,
    pub tile_row: u32,
    pub tile_col: u32,
    pub sub_row: u32,
    pub sub_col: u32,
}

/// How an elevation value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Real,
    SyntheticFallback,
}

/// The durable result for one `SubtileKey`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtileRecord {
    pub level: u32,
    pub subtiles_per_side: u32,
    pub coarse_row: u32,
    pub coarse_col: u32,
    pub sub_row: u32,
    pub sub_col: u32,
    pub center_lat: f64,
    pub center_lon: f64,
    /// `None` encodes `NaN` ("sampled but no data") on the wire and on disk.
    pub elevation: Option<f64>,
    pub source: Source,
    pub sampled_at: DateTime<Utc>,
    pub attempts: u32,
}

impl SubtileRecord {
    /// The elevation as an `f64`, with `None` decoded back to `NaN`.
    pub fn elevation_f64(&self) -> f64 {
        self.elevation.unwrap_or(f64::NAN)
    }

    pub fn set_elevation(&mut self, value: f64) {
        self.elevation = if value.is_nan() { None } else { Some(value) };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounters {
    pub scheduled: u64,
    pub completed: u64,
    pub positive: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub region: Region,
    pub levels: u32,
    pub grid: Grid,
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub last_error: Option<LastError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: TaskId, region: Region, levels: u32, grid: Grid) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            region,
            levels,
            grid,
            status: TaskStatus::Pending,
            counters: TaskCounters::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Total subtile count across all levels: `Gy*Gx*sum(s(l)^2 for l in 0..levels)`.
    pub fn total_subtiles(&self) -> u64 {
        let tiles = self.grid.tile_count() as u64;
        let per_tile: u64 = (0..self.levels)
            .map(|level| {
                let side = crate::region::subtiles_per_side(level) as u64;
                side * side
            })
            .sum();
        tiles * per_tile
    }
}
