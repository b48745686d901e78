//! Real `ElevationProvider` backed by local SRTM/HGT tiles, adapted from
//! the same moka-cached, bilinear-interpolated lookup used for live
//! aircraft AGL elsewhere in this codebase.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::ScanError;

use super::hgt::HGT;
use super::sampler::ElevationProvider;

/// Cache key for elevation lookups, rounded to a ~100m grid so adjacent
/// subtile centers within a tile share a cache entry.
fn round_coord_for_cache(coord: f64) -> i32 {
    (coord * 1000.0).round() as i32
}

pub struct HgtElevationProvider {
    storage_path: PathBuf,
    elevation_cache: Cache<(i32, i32), Option<i16>>,
    tile_cache: Cache<(i32, i32), Arc<HGT>>,
}

impl HgtElevationProvider {
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            elevation_cache: Cache::builder().max_capacity(500_000).build(),
            tile_cache: Cache::builder().max_capacity(1_000).build(),
        }
    }

    fn tile_path(&self, lat_floor: i32, lon_floor: i32) -> PathBuf {
        let lat_prefix = if lat_floor < 0 { "S" } else { "N" };
        let lon_prefix = if lon_floor < 0 { "W" } else { "E" };
        let lat_dir = format!("{}{:02}", lat_prefix, lat_floor.abs());
        let filename = format!("{}{}{:03}.hgt.gz", lat_dir, lon_prefix, lon_floor.abs());
        self.storage_path.join(&lat_dir).join(filename)
    }

    async fn lookup(&self, lat: f64, lon: f64) -> Result<Option<i16>, ScanError> {
        let cache_key = (round_coord_for_cache(lat), round_coord_for_cache(lon));
        if let Some(cached) = self.elevation_cache.get(&cache_key).await {
            return Ok(cached);
        }

        let lat_floor = lat.floor() as i32;
        let lon_floor = lon.floor() as i32;
        let tile_key = (lat_floor, lon_floor);

        let tile = if let Some(cached) = self.tile_cache.get(&tile_key).await {
            cached
        } else {
            let path = self.tile_path(lat_floor, lon_floor);
            if !path.exists() {
                self.elevation_cache.insert(cache_key, None).await;
                return Ok(None);
            }
            let hgt = HGT::from_file(&path, (lat_floor as f64, lon_floor as f64))
                .await
                .map_err(|e| ScanError::TransientSamplerError(e.to_string()))?;
            let hgt = Arc::new(hgt);
            self.tile_cache.insert(tile_key, hgt.clone()).await;
            hgt
        };

        let elevation = tile.get_elevation(lat, lon).ok();
        self.elevation_cache.insert(cache_key, elevation).await;
        Ok(elevation)
    }
}

#[async_trait]
impl ElevationProvider for HgtElevationProvider {
    async fn sample_real(&self, lat: f64, lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        match self.lookup(lat, lon).await? {
            Some(value) => Ok(value as f64),
            None => Err(ScanError::TransientSamplerError(
                "no HGT tile covers this point".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_path_matches_srtm_naming_convention() {
        let provider = HgtElevationProvider::new(PathBuf::from("/data/elevation"));
        assert_eq!(
            provider.tile_path(45, 9),
            PathBuf::from("/data/elevation/N45/N45E009.hgt.gz")
        );
        assert_eq!(
            provider.tile_path(-45, -9),
            PathBuf::from("/data/elevation/S45/S45W009.hgt.gz")
        );
    }

    #[tokio::test]
    async fn missing_tile_errors_as_transient_so_executor_falls_back() {
        let provider = HgtElevationProvider::new(PathBuf::from("/nonexistent/path"));
        let err = provider.sample_real(45.0, 9.0, 30.0).await.unwrap_err();
        assert!(err.is_transient());
    }
}
