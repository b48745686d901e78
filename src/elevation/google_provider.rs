//! Real `ElevationProvider` backed by the Google Maps Elevation API, for
//! deployments without local SRTM/HGT coverage.

use std::str::FromStr;

use async_trait::async_trait;
use google_maps::Client as GoogleMapsClient;
use google_maps::LatLng;
use num_traits::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::ScanError;

use super::sampler::ElevationProvider;

pub struct GoogleElevationProvider {
    client: GoogleMapsClient,
}

impl GoogleElevationProvider {
    pub fn new(client: GoogleMapsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ElevationProvider for GoogleElevationProvider {
    async fn sample_real(&self, lat: f64, lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        let lat_decimal = Decimal::from_str(&lat.to_string())
            .map_err(|e| ScanError::TransientSamplerError(format!("invalid latitude: {e}")))?;
        let lon_decimal = Decimal::from_str(&lon.to_string())
            .map_err(|e| ScanError::TransientSamplerError(format!("invalid longitude: {e}")))?;
        let latlng = LatLng::try_from_dec(lat_decimal, lon_decimal)
            .map_err(|e| ScanError::TransientSamplerError(format!("invalid coordinates: {e}")))?;

        let response = self
            .client
            .elevation()
            .for_positional_request(latlng)
            .execute()
            .await
            .map_err(|e| {
                ScanError::TransientSamplerError(format!("google elevation request failed: {e}"))
            })?;

        let result = response
            .results
            .first()
            .ok_or_else(|| ScanError::TransientSamplerError("no elevation results".into()))?;

        result
            .elevation
            .to_f64()
            .ok_or_else(|| {
                ScanError::TransientSamplerError("non-finite elevation from provider".into())
            })
    }
}
