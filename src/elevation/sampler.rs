//! Elevation Sampler (C1): one operation, `sample`, with a mandatory
//! synthetic fallback so the scan never stalls on a bad point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ScanError;
use crate::model::Source;

use super::synthetic::synthetic_elevation;

/// Sentinel value the external interface uses for "no data" points.
pub const SENTINEL: f64 = -9999.0;

pub struct SampleResult {
    pub elevation: f64,
    pub source: Source,
}

/// A real elevation data source. Implementations attempt one lookup and
/// either return a value (`SENTINEL` allowed; the sampler coerces it) or
/// an error — they never retry and never fall back themselves.
#[async_trait]
pub trait ElevationProvider: Send + Sync {
    async fn sample_real(&self, lat: f64, lon: f64, resolution_m: f64) -> Result<f64, ScanError>;
}

/// Wraps a real `ElevationProvider` with the deadline and synthetic
/// fallback the external contract requires. Retries belong to the
/// Scan Executor, not here: a single call either returns a real value or
/// degrades to synthetic, deterministically, so the caller never blocks
/// waiting on this layer beyond `deadline`.
pub struct ElevationSampler {
    provider: Arc<dyn ElevationProvider>,
}

impl ElevationSampler {
    pub fn new(provider: Arc<dyn ElevationProvider>) -> Self {
        Self { provider }
    }

    pub async fn sample(
        &self,
        lat: f64,
        lon: f64,
        _buffer_radius_m: f64,
        resolution_m: f64,
        deadline: Duration,
    ) -> Result<SampleResult, ScanError> {
        let attempt = tokio::time::timeout(
            deadline,
            self.provider.sample_real(lat, lon, resolution_m),
        )
        .await;

        match attempt {
            Ok(Ok(value)) if value != SENTINEL && value.is_finite() => Ok(SampleResult {
                elevation: value,
                source: Source::Real,
            }),
            Ok(Ok(_sentinel_or_nan)) => {
                debug!(lat, lon, "provider returned sentinel, using synthetic fallback");
                Err(ScanError::TransientSamplerError(
                    "provider returned sentinel value".into(),
                ))
            }
            Ok(Err(err)) => {
                debug!(lat, lon, %err, "provider error, using synthetic fallback");
                Err(err)
            }
            Err(_elapsed) => {
                warn!(lat, lon, ?deadline, "sampler deadline exceeded");
                Err(ScanError::TransientSamplerError("deadline exceeded".into()))
            }
        }
    }

    /// Deterministic fallback used by the executor once its retry budget
    /// is exhausted. Pure and infallible by construction: if this ever
    /// failed too, both the real and synthetic paths would have failed,
    /// which the contract treats as a programming error (`Unavailable`).
    pub fn synthetic(&self, lat: f64, lon: f64) -> f64 {
        synthetic_elevation(lat, lon)
    }
}

#[cfg(test)]
pub struct FakeProvider {
    pub behavior: FakeBehavior,
}

#[cfg(test)]
pub enum FakeBehavior {
    AlwaysReal(f64),
    AlwaysError,
    AlwaysSentinel,
}

#[cfg(test)]
#[async_trait]
impl ElevationProvider for FakeProvider {
    async fn sample_real(&self, _lat: f64, _lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        match self.behavior {
            FakeBehavior::AlwaysReal(v) => Ok(v),
            FakeBehavior::AlwaysError => Err(ScanError::TransientSamplerError("fake error".into())),
            FakeBehavior::AlwaysSentinel => Ok(SENTINEL),
        }
    }
}
