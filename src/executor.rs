//! Scan Executor (C4): a bounded worker pool that drains the schedule,
//! samples elevations, writes the cache, and publishes on the bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::bus::{Bus, TileResult};
use crate::cache::CacheBackend;
use crate::elevation::ElevationSampler;
use crate::error::ScanError;
use crate::model::{LastError, Source, SubtileKey, SubtileRecord, TaskId};
use crate::region::{Grid, Region, subtile_center, subtiles_per_side};
use crate::schedule::ScheduleCursor;

/// Atomic counterpart of `TaskCounters`, safe to update concurrently from
/// every worker without a lock.
#[derive(Default)]
pub struct AtomicCounters {
    pub scheduled: AtomicU64,
    pub completed: AtomicU64,
    pub positive: AtomicU64,
    pub failed: AtomicU64,
}

impl AtomicCounters {
    pub fn snapshot(&self) -> crate::model::TaskCounters {
        crate::model::TaskCounters {
            scheduled: self.scheduled.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            positive: self.positive.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// The `ScanError` that triggered (or would trigger) a task's `Failed`
/// transition, shared across workers so `finalize_task` can surface
/// `kind + human message` on `task.last_error` per spec §7. Only
/// persistent cache-write errors reach this; sampler errors never do
/// (they are always absorbed into the synthetic fallback).
#[derive(Default)]
pub struct FailureSlot {
    inner: std::sync::Mutex<Option<LastError>>,
}

impl FailureSlot {
    /// Records the first failure seen; later ones are ignored so the
    /// reported `last_error` points at the original cause.
    pub fn record(&self, err: &ScanError) {
        let mut guard = self.inner.lock().expect("failure slot mutex poisoned");
        if guard.is_none() {
            *guard = Some(LastError {
                kind: error_kind(err).to_string(),
                message: err.to_string(),
            });
        }
    }

    pub fn take(&self) -> Option<LastError> {
        self.inner.lock().expect("failure slot mutex poisoned").clone()
    }
}

fn error_kind(err: &ScanError) -> &'static str {
    match err {
        ScanError::TransientSamplerError(_) => "TransientSamplerError",
        ScanError::CacheErrorTransient(_) => "CacheErrorTransient",
        ScanError::CacheErrorFatal(_) => "CacheErrorFatal",
        ScanError::ScheduleExhausted => "ScheduleExhausted",
        ScanError::SlowConsumer(_) => "SlowConsumer",
        ScanError::ClientProtocolError(_) => "ClientProtocolError",
        ScanError::InvalidConfig(_) => "InvalidConfig",
        ScanError::InvalidRegion(_) => "InvalidRegion",
        ScanError::Unavailable(_) => "Unavailable",
    }
}

/// Cooperative pause/stop signal shared by every worker in a task's pool.
pub struct ExecutionControl {
    pub paused: AtomicBool,
    pub cancel: CancellationToken,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Executor {
    cache: Arc<dyn CacheBackend>,
    bus: Arc<Bus>,
    sampler: Arc<ElevationSampler>,
    max_attempts: u32,
    sampler_deadline: Duration,
}

impl Executor {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        bus: Arc<Bus>,
        sampler: Arc<ElevationSampler>,
        max_attempts: u32,
        sampler_deadline: Duration,
    ) -> Self {
        Self {
            cache,
            bus,
            sampler,
            max_attempts,
            sampler_deadline,
        }
    }

    /// Drains `cursor` with `worker_count` concurrent workers until the
    /// schedule is exhausted or `control.cancel` fires. Returns once every
    /// worker has stopped.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn run(
        &self,
        task_id: TaskId,
        region: Region,
        grid: Grid,
        cursor: Arc<ScheduleCursor>,
        counters: Arc<AtomicCounters>,
        control: Arc<ExecutionControl>,
        failure: Arc<FailureSlot>,
        worker_count: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let cache = self.cache.clone();
            let bus = self.bus.clone();
            let sampler = self.sampler.clone();
            let cursor = cursor.clone();
            let counters = counters.clone();
            let control = control.clone();
            let failure = failure.clone();
            let semaphore = semaphore.clone();
            let max_attempts = self.max_attempts;
            let sampler_deadline = self.sampler_deadline;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                worker_loop(
                    worker_id,
                    region,
                    grid,
                    cache,
                    bus,
                    sampler,
                    cursor,
                    counters,
                    control,
                    failure,
                    max_attempts,
                    sampler_deadline,
                )
                .await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!(task_id = %task_id, "executor drained");
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    region: Region,
    grid: Grid,
    cache: Arc<dyn CacheBackend>,
    bus: Arc<Bus>,
    sampler: Arc<ElevationSampler>,
    cursor: Arc<ScheduleCursor>,
    counters: Arc<AtomicCounters>,
    control: Arc<ExecutionControl>,
    failure: Arc<FailureSlot>,
    max_attempts: u32,
    sampler_deadline: Duration,
) {
    loop {
        if control.cancel.is_cancelled() {
            return;
        }
        // Cooperative pause: hold here between subtiles, never mid-`put`.
        while control.paused.load(Ordering::SeqCst) {
            if control.cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let Some(key) = cursor.next_key() else {
            return; // ScheduleExhausted: not an error, the task completes.
        };

        if let Err(err) = process_key(
            worker_id,
            &region,
            &grid,
            &cache,
            &bus,
            &sampler,
            key,
            max_attempts,
            sampler_deadline,
            &counters,
        )
        .await
        {
            warn!(worker_id, ?key, %err, "worker failed to write subtile record");
            failure.record(&err);
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_key(
    worker_id: usize,
    region: &Region,
    grid: &Grid,
    cache: &Arc<dyn CacheBackend>,
    bus: &Arc<Bus>,
    sampler: &Arc<ElevationSampler>,
    key: SubtileKey,
    max_attempts: u32,
    sampler_deadline: Duration,
    counters: &Arc<AtomicCounters>,
) -> Result<(), ScanError> {
    // Resumability: a key already durable in the cache needs no sampling.
    // A fatal read error (corrupted record) is logged and treated as a
    // miss so the key gets re-sampled, per spec: it is not a reason to
    // fail the subtile.
    match cache.get(&key).await {
        Ok(Some(existing)) => {
            metrics::counter!("scan_cache_hits_total").increment(1);
            publish_and_count(bus, counters, key, existing);
            return Ok(());
        }
        Ok(None) => {}
        Err(ScanError::CacheErrorFatal(msg)) => {
            warn!(worker_id, ?key, %msg, "corrupt cache record on read, re-scheduling key");
        }
        Err(err) => return Err(err),
    }
    metrics::counter!("scan_cache_misses_total").increment(1);

    let side = subtiles_per_side(key.level);
    let (center_lat, center_lon) = subtile_center(
        region,
        grid,
        key.level,
        key.tile_row,
        key.tile_col,
        key.sub_row,
        key.sub_col,
    );

    let record = sample_with_retry(
        worker_id,
        sampler,
        center_lat,
        center_lon,
        side,
        key,
        max_attempts,
        sampler_deadline,
    )
    .await;

    put_with_retry(worker_id, cache, &key, &record, max_attempts).await?;
    publish_and_count(bus, counters, key, record);
    Ok(())
}

/// Retries a transient cache write with the same capped-exponential
/// backoff as `sample_with_retry`; a fatal error, or a transient one
/// still failing after `max_attempts` retries, propagates and fails
/// the task via `finalize_task`.
async fn put_with_retry(
    worker_id: usize,
    cache: &Arc<dyn CacheBackend>,
    key: &SubtileKey,
    record: &SubtileRecord,
    max_attempts: u32,
) -> Result<(), ScanError> {
    let mut attempts = 0u32;
    let mut backoff = Duration::from_millis(100);

    loop {
        attempts += 1;
        match cache.put(key, record).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempts <= max_attempts => {
                warn!(worker_id, ?key, %err, attempts, "transient cache write error, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(2));
            }
            Err(err) => return Err(err),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn sample_with_retry(
    worker_id: usize,
    sampler: &Arc<ElevationSampler>,
    center_lat: f64,
    center_lon: f64,
    subtiles_per_side: u32,
    key: SubtileKey,
    max_attempts: u32,
    sampler_deadline: Duration,
) -> SubtileRecord {
    let mut attempts = 0u32;
    let mut backoff = Duration::from_millis(100);

    loop {
        attempts += 1;
        match sampler
            .sample(center_lat, center_lon, 0.0, 30.0, sampler_deadline)
            .await
        {
            Ok(result) => {
                let source_label = match result.source {
                    Source::Real => "real",
                    Source::SyntheticFallback => "synthetic_fallback",
                };
                metrics::counter!("scan_subtiles_sampled_total", "source" => source_label).increment(1);
                return SubtileRecord {
                    level: key.level,
                    subtiles_per_side,
                    coarse_row: key.tile_row,
                    coarse_col: key.tile_col,
                    sub_row: key.sub_row,
                    sub_col: key.sub_col,
                    center_lat,
                    center_lon,
                    elevation: None,
                    source: result.source,
                    sampled_at: chrono::Utc::now(),
                    attempts,
                }
                .with_elevation(result.elevation);
            }
            Err(err) if attempts > max_attempts => {
                warn!(worker_id, ?key, %err, attempts, "sampler exhausted, using synthetic fallback");
                metrics::counter!("scan_subtiles_sampled_total", "source" => "synthetic_fallback").increment(1);
                metrics::counter!("scan_subtiles_failed_total").increment(1);
                let value = sampler.synthetic(center_lat, center_lon);
                return SubtileRecord {
                    level: key.level,
                    subtiles_per_side,
                    coarse_row: key.tile_row,
                    coarse_col: key.tile_col,
                    sub_row: key.sub_row,
                    sub_col: key.sub_col,
                    center_lat,
                    center_lon,
                    elevation: None,
                    source: Source::SyntheticFallback,
                    sampled_at: chrono::Utc::now(),
                    attempts,
                }
                .with_elevation(value);
            }
            Err(_) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(2));
            }
        }
    }
}

fn publish_and_count(
    bus: &Arc<Bus>,
    counters: &Arc<AtomicCounters>,
    key: SubtileKey,
    record: SubtileRecord,
) {
    let positive = record.elevation.is_some();
    bus.publish(TileResult { key, record });
    counters.completed.fetch_add(1, Ordering::SeqCst);
    if positive {
        counters.positive.fetch_add(1, Ordering::SeqCst);
    }
}

impl SubtileRecord {
    fn with_elevation(mut self, value: f64) -> Self {
        self.set_elevation(value);
        self
    }
}
