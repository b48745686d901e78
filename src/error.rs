//! Domain error kinds for the scan pipeline.
//!
//! Internal code returns `Result<T, ScanError>`; binary-boundary code
//! (CLI, `main`) wraps these in `anyhow::Result` with `.context(...)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("transient sampler error: {0}")]
    TransientSamplerError(String),

    #[error("transient cache error: {0}")]
    CacheErrorTransient(String),

    #[error("fatal cache error: {0}")]
    CacheErrorFatal(String),

    #[error("schedule exhausted")]
    ScheduleExhausted,

    #[error("slow consumer: {0}")]
    SlowConsumer(String),

    #[error("client protocol error: {0}")]
    ClientProtocolError(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ScanError {
    /// Whether a caller should retry the operation that produced this error,
    /// per the transient/fatal split in spec §7.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::TransientSamplerError(_) | ScanError::CacheErrorTransient(_)
        )
    }
}
