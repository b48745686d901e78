//! Geodetic region, coarse tile grid, and subtile geometry.
//!
//! Distances use an equirectangular approximation at the region's center
//! latitude, matching the precision the rest of the scan pipeline needs
//! (tile sizing and hopping order, not survey-grade geodesy).

use geo::{Contains, Point, Rect};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Mean Earth radius in meters, used for the equirectangular metric conversion.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Region {
    pub fn validate(&self) -> Result<(), ScanError> {
        let finite = [self.lat_min, self.lat_max, self.lon_min, self.lon_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(ScanError::InvalidRegion("coordinates must be finite".into()));
        }
        if !(-90.0..=90.0).contains(&self.lat_min) || !(-90.0..=90.0).contains(&self.lat_max) {
            return Err(ScanError::InvalidRegion("latitude out of range".into()));
        }
        if !(-180.0..=180.0).contains(&self.lon_min) || !(-180.0..=180.0).contains(&self.lon_max) {
            return Err(ScanError::InvalidRegion("longitude out of range".into()));
        }
        if self.lat_min >= self.lat_max {
            return Err(ScanError::InvalidRegion("lat_min must be < lat_max".into()));
        }
        if self.lon_min >= self.lon_max {
            return Err(ScanError::InvalidRegion("lon_min must be < lon_max".into()));
        }
        Ok(())
    }

    /// Latitude at the region's center, used as the reference parallel for
    /// equirectangular distance conversion.
    pub fn center_lat(&self) -> f64 {
        (self.lat_min + self.lat_max) / 2.0
    }

    pub fn center_lon(&self) -> f64 {
        (self.lon_min + self.lon_max) / 2.0
    }

    /// Width and height of the region in meters, using the equirectangular
    /// approximation evaluated at `center_lat()`.
    pub fn extent_meters(&self) -> (f64, f64) {
        let lat_rad = self.center_lat().to_radians();
        let width_m = (self.lon_max - self.lon_min).to_radians() * EARTH_RADIUS_M * lat_rad.cos();
        let height_m = (self.lat_max - self.lat_min).to_radians() * EARTH_RADIUS_M;
        (width_m.abs(), height_m.abs())
    }

    /// `(lon, lat)` bounding rectangle, for callers that want `geo`'s
    /// coordinate types instead of raw tuples (e.g. point-in-region checks).
    pub fn bbox(&self) -> Rect<f64> {
        Rect::new(
            (self.lon_min, self.lat_min),
            (self.lon_max, self.lat_max),
        )
    }

    pub fn center(&self) -> Point<f64> {
        Point::new(self.center_lon(), self.center_lat())
    }
}

/// The coarse `Gy x Gx` grid a region is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub rows: u32,
    pub cols: u32,
}

impl Grid {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ScanError::InvalidConfig("grid dimensions must be positive".into()));
        }
        Ok(())
    }

    pub fn tile_count(&self) -> u32 {
        self.rows * self.cols
    }
}

/// Number of subtiles per side of a coarse tile at level `level`: `2^level`.
pub fn subtiles_per_side(level: u32) -> u32 {
    1u32 << level
}

/// Geometric center of one subtile, in (lat, lon).
///
/// `(tile_row, tile_col)` locate the coarse tile within `grid`; `(sub_row,
/// sub_col)` locate the subtile within the tile at `level`.
pub fn subtile_center(
    region: &Region,
    grid: &Grid,
    level: u32,
    tile_row: u32,
    tile_col: u32,
    sub_row: u32,
    sub_col: u32,
) -> (f64, f64) {
    let lat_span = (region.lat_max - region.lat_min) / grid.rows as f64;
    let lon_span = (region.lon_max - region.lon_min) / grid.cols as f64;

    let tile_lat_min = region.lat_min + tile_row as f64 * lat_span;
    let tile_lon_min = region.lon_min + tile_col as f64 * lon_span;

    let side = subtiles_per_side(level) as f64;
    let sub_lat_span = lat_span / side;
    let sub_lon_span = lon_span / side;

    let lat = tile_lat_min + (sub_row as f64 + 0.5) * sub_lat_span;
    let lon = tile_lon_min + (sub_col as f64 + 0.5) * sub_lon_span;
    (lat, lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_region() -> Region {
        Region {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        }
    }

    #[test]
    fn validate_rejects_degenerate_region() {
        let bad = Region {
            lat_min: 1.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_latitude() {
        let bad = Region {
            lat_min: -100.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn subtiles_per_side_doubles_each_level() {
        assert_eq!(subtiles_per_side(0), 1);
        assert_eq!(subtiles_per_side(1), 2);
        assert_eq!(subtiles_per_side(2), 4);
        assert_eq!(subtiles_per_side(3), 8);
    }

    #[test]
    fn subtile_center_is_within_tile_bounds() {
        let region = test_region();
        let grid = Grid { rows: 2, cols: 2 };
        let (lat, lon) = subtile_center(&region, &grid, 1, 0, 0, 1, 1);
        assert!(lat > 0.0 && lat < 0.5);
        assert!(lon > 0.0 && lon < 0.5);
    }

    #[test]
    fn single_subtile_region_centers_on_region() {
        let region = test_region();
        let grid = Grid { rows: 1, cols: 1 };
        let (lat, lon) = subtile_center(&region, &grid, 0, 0, 0, 0, 0);
        assert!((lat - 0.5).abs() < 1e-9);
        assert!((lon - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bbox_contains_center() {
        let region = test_region();
        let bbox = region.bbox();
        let center = region.center();
        assert!(bbox.contains(&center));
    }

    #[test]
    fn extent_meters_is_positive_and_reasonable() {
        let region = Region {
            lat_min: 45.0,
            lat_max: 45.01,
            lon_min: 9.0,
            lon_max: 9.01,
        };
        let (w, h) = region.extent_meters();
        // ~0.01 degrees is roughly 700-800m at this latitude in both axes.
        assert!(w > 500.0 && w < 1000.0);
        assert!(h > 500.0 && h < 1500.0);
    }
}
