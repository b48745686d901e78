//! Snapshot Renderer (C5): renders all cached subtiles of a level into a
//! single PNG, for use as a background layer while tiles stream in.
//!
//! Grounded in the corpus's tiling pipeline use of the `image` crate for
//! tile/level rendering: we allocate one pixel per subtile cell (not a
//! georeferenced raster), color-ramp present elevations, and fill missing
//! cells with a neutral gray.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{ImageBuffer, ImageEncoder, Rgb, RgbImage};

use crate::cache::SnapshotFingerprint;
use crate::error::ScanError;
use crate::model::{SubtileKey, SubtileRecord};
use crate::region::{Grid, subtiles_per_side};

/// Neutral fill color for subtiles with no cached record yet.
const MISSING_COLOR: Rgb<u8> = Rgb([128, 128, 128]);

#[async_trait]
pub trait SnapshotRenderer: Send + Sync {
    async fn render(
        &self,
        grid: Grid,
        level: u32,
        records: &[(SubtileKey, SubtileRecord)],
    ) -> Result<Vec<u8>, ScanError>;
}

/// Computes the `{count, max_sampled_at}` fingerprint of a set of cached
/// subtiles, used to decide whether a snapshot needs regenerating.
pub fn fingerprint_of(records: &[(SubtileKey, SubtileRecord)]) -> SnapshotFingerprint {
    let max_sampled_at: Option<DateTime<Utc>> = records.iter().map(|(_, r)| r.sampled_at).max();
    SnapshotFingerprint {
        count: records.len() as u64,
        max_sampled_at,
    }
}

/// Whether a snapshot needs to be rebuilt: its fingerprint's `count` must
/// have grown by at least `delta` since the last render, or this is the
/// first render for the level (`previous` is `None`).
pub fn needs_regen(
    previous: Option<&SnapshotFingerprint>,
    current: &SnapshotFingerprint,
    delta: u64,
) -> bool {
    match previous {
        None => current.count > 0,
        Some(prev) => current.count.saturating_sub(prev.count) >= delta,
    }
}

/// Renders levels into a flat grid of colored cells using the `image`
/// crate, one pixel-cell per subtile.
pub struct ImageSnapshotRenderer {
    /// Pixel size of one subtile cell's square, for visibility at low levels.
    cell_px: u32,
}

impl ImageSnapshotRenderer {
    pub fn new(cell_px: u32) -> Self {
        Self { cell_px: cell_px.max(1) }
    }
}

impl Default for ImageSnapshotRenderer {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl SnapshotRenderer for ImageSnapshotRenderer {
    async fn render(
        &self,
        grid: Grid,
        level: u32,
        records: &[(SubtileKey, SubtileRecord)],
    ) -> Result<Vec<u8>, ScanError> {
        let side = subtiles_per_side(level);
        let cols = grid.cols * side;
        let rows = grid.rows * side;
        let cell = self.cell_px;

        let width = (cols * cell).max(1);
        let height = (rows * cell).max(1);

        let mut image: RgbImage = ImageBuffer::from_pixel(width, height, MISSING_COLOR);

        let elevations: Vec<f64> = records
            .iter()
            .filter_map(|(_, r)| {
                let v = r.elevation_f64();
                (!v.is_nan()).then_some(v)
            })
            .collect();
        let (min_e, max_e) = elevations.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), &v| (lo.min(v), hi.max(v)),
        );
        let span = (max_e - min_e).max(1e-6);

        for (key, record) in records {
            let color = match record.elevation {
                None => MISSING_COLOR,
                Some(value) => elevation_color((value - min_e) / span),
            };
            let global_col = key.tile_col * side + key.sub_col;
            let global_row = key.tile_row * side + key.sub_row;
            paint_cell(&mut image, global_row, global_col, cell, color);
        }

        let mut bytes: Vec<u8> = Vec::new();
        image::codecs::png::PngEncoder::new(&mut bytes)
            .write_image(
                image.as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| ScanError::CacheErrorFatal(format!("png encode: {e}")))?;
        Ok(bytes)
    }
}

fn paint_cell(image: &mut RgbImage, row: u32, col: u32, cell: u32, color: Rgb<u8>) {
    let x0 = col * cell;
    let y0 = row * cell;
    for dy in 0..cell {
        for dx in 0..cell {
            if x0 + dx < image.width() && y0 + dy < image.height() {
                image.put_pixel(x0 + dx, y0 + dy, color);
            }
        }
    }
}

/// Simple blue-to-green-to-brown elevation ramp over `t in [0, 1]`.
fn elevation_color(t: f64) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        let u = t / 0.5;
        (30.0 + u * 60.0, 90.0 + u * 90.0, 160.0 - u * 100.0)
    } else {
        let u = (t - 0.5) / 0.5;
        (90.0 + u * 100.0, 180.0 - u * 80.0, 60.0 - u * 40.0)
    };
    Rgb([r as u8, g as u8, b as u8])
}
