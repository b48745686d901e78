//! Scan Planner: builds the deterministic, hopping multi-level schedule,
//! and the cursor workers pull from to consume it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::{SubtileKey, TaskId};
use crate::region::{Grid, subtiles_per_side};

/// Reverses the low `bits` bits of `value`. Used to turn a raster index
/// into a spatially spread ("hopping") one: the first indices visited in
/// reversed order are corner/quadrant representatives, not a raster sweep.
fn bit_reverse(value: u32, bits: u32) -> u32 {
    let mut result = 0u32;
    let mut v = value;
    for _ in 0..bits {
        result = (result << 1) | (v & 1);
        v >>= 1;
    }
    result
}

/// Smallest `b` such that `count <= 2^b`.
fn bits_for(count: u32) -> u32 {
    if count <= 1 {
        0
    } else {
        32 - (count - 1).leading_zeros()
    }
}

/// Bit-reversed permutation of `0..count`, used as both the tile visit
/// order and the subtile visit order within a tile.
fn hopping_order(count: u32) -> Vec<u32> {
    let bits = bits_for(count);
    let mut order: Vec<u32> = (0..count).collect();
    order.sort_by_key(|&i| bit_reverse(i, bits));
    order
}

/// Builds the full, deterministic schedule for one task: level 0 emitted
/// for every tile in hopping order, then level 1, and so on. Within a
/// level, tiles are visited in hopping order and each tile's subtiles are
/// visited in hopping order. Resuming a task reproduces this exact
/// sequence, since it depends only on `(grid, levels)`.
pub fn build_schedule(task_id: TaskId, grid: Grid, levels: u32) -> Vec<SubtileKey> {
    let tile_count = grid.tile_count();
    let tile_order = hopping_order(tile_count);

    let mut keys = Vec::new();
    for level in 0..levels {
        let side = subtiles_per_side(level);
        let sub_count = side * side;
        let sub_order = hopping_order(sub_count);

        for &tile_idx in &tile_order {
            let tile_row = tile_idx / grid.cols;
            let tile_col = tile_idx % grid.cols;
            for &sub_idx in &sub_order {
                let sub_row = sub_idx / side;
                let sub_col = sub_idx % side;
                keys.push(SubtileKey {
                    task_id,
                    level,
                    tile_row,
                    tile_col,
                    sub_row,
                    sub_col,
                });
            }
        }
    }
    keys
}

/// The schedule iterator workers pull from. Handing out a key is the only
/// point of inter-worker mutual exclusion; it is implemented with a single
/// atomic counter rather than a lock since claiming a slot is the entire
/// critical section.
pub struct ScheduleCursor {
    keys: Vec<SubtileKey>,
    next_index: AtomicUsize,
}

impl ScheduleCursor {
    pub fn new(keys: Vec<SubtileKey>) -> Self {
        Self {
            keys,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn total(&self) -> usize {
        self.keys.len()
    }

    /// Claims the next key, or `None` once the schedule is exhausted
    /// (`ScheduleExhausted`, which is not an error — it means `completed`).
    pub fn next_key(&self) -> Option<SubtileKey> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.keys.get(index).copied()
    }

    /// Claims up to `n` keys at once, for resumability prefetch at startup.
    pub fn next_batch(&self, n: usize) -> Vec<SubtileKey> {
        let start = self.next_index.fetch_add(n, Ordering::SeqCst);
        if start >= self.keys.len() {
            return Vec::new();
        }
        let end = (start + n).min(self.keys.len());
        self.keys[start..end].to_vec()
    }
}
