//! End-to-end scenario tests driving the Task Controller, Scan Executor,
//! Subtile Cache, Central Bus, and Session Broker together through the
//! public API, instead of exercising each module in isolation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scanrel::bus::Bus;
use scanrel::cache::{CacheBackend, FsCacheBackend};
use scanrel::config::Config;
use scanrel::controller::TaskController;
use scanrel::elevation::{ElevationProvider, ElevationSampler};
use scanrel::error::ScanError;
use scanrel::model::{Source, SubtileKey, SubtileRecord, TaskStatus};
use scanrel::region::{Grid, Region};
use scanrel::snapshot::{ImageSnapshotRenderer, SnapshotRenderer};

fn small_region() -> Region {
    Region { lat_min: 0.0, lat_max: 0.01, lon_min: 0.0, lon_max: 0.01 }
}

/// Counts every `sample_real` call, for asserting exactly which keys a
/// resumed scan re-samples.
struct CountingReal {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ElevationProvider for CountingReal {
    async fn sample_real(&self, lat: f64, _lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(lat * 1000.0)
    }
}

/// A real provider with a small artificial per-call delay, slow enough
/// that a viewer session can attach mid-scan.
struct SlowReal {
    delay: Duration,
}

#[async_trait]
impl ElevationProvider for SlowReal {
    async fn sample_real(&self, lat: f64, _lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        tokio::time::sleep(self.delay).await;
        Ok(lat * 1000.0)
    }
}

/// A provider that always fails, for exercising the synthetic fallback.
struct AlwaysFails;

#[async_trait]
impl ElevationProvider for AlwaysFails {
    async fn sample_real(&self, _lat: f64, _lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
        Err(ScanError::TransientSamplerError("sampler down".into()))
    }
}

fn test_config(cache_root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.cache_root = cache_root.to_path_buf();
    config.grid_y = 2;
    config.grid_x = 2;
    config.levels = 2;
    config.worker_count = 4;
    config.max_attempts = 2;
    config.sampler_deadline_ms = 200;
    config
}

fn controller_with(
    cache_root: &std::path::Path,
    provider: Arc<dyn ElevationProvider>,
    config: Config,
) -> Arc<TaskController> {
    let cache: Arc<dyn CacheBackend> = Arc::new(FsCacheBackend::new(cache_root.to_path_buf()));
    let bus = Arc::new(Bus::new(1024));
    let sampler = Arc::new(ElevationSampler::new(provider));
    let renderer: Arc<dyn SnapshotRenderer> = Arc::new(ImageSnapshotRenderer::default());
    Arc::new(TaskController::new(cache, bus, sampler, renderer, config))
}

async fn wait_for_completion(controller: &TaskController, task_id: scanrel::model::TaskId) {
    for _ in 0..500 {
        if matches!(controller.status(task_id).await.unwrap().status, TaskStatus::Completed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task did not reach completed in time");
}

fn subtile_path(cache_root: &std::path::Path, key: &SubtileKey) -> std::path::PathBuf {
    cache_root
        .join("tasks")
        .join(key.task_id.to_string())
        .join("cache")
        .join("subtile_data")
        .join(format!("level_{}", key.level))
        .join(format!("tile_{}_{}", key.tile_row, key.tile_col))
        .join(format!("subtile_{}_{}.json", key.sub_row, key.sub_col))
}

/// S1: a fresh 2x2 grid, 2-level scan has `total_subtiles = 2*2*(1+4) =
/// 20`, and running it to completion durably caches all 20 (4 at level
/// 0, 16 at level 1).
#[tokio::test]
async fn s1_small_region_completes_with_twenty_subtiles() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = controller_with(dir.path(), Arc::new(CountingReal { calls }), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();
    let task = controller.get_task(task_id).await.unwrap();
    assert_eq!(task.total_subtiles(), 20);

    controller.start(task_id).await.unwrap();
    wait_for_completion(&controller, task_id).await;

    let status = controller.status(task_id).await.unwrap();
    assert_eq!(status.counters.completed, 20);

    let level0 = controller.cache().list(task_id, 0).await.unwrap();
    let level1 = controller.cache().list(task_id, 1).await.unwrap();
    assert_eq!(level0.len(), 4);
    assert_eq!(level1.len(), 16);
}

/// S2: deleting cached subtile files and calling `start` again only
/// re-samples the deleted keys — everything else is resumed straight
/// from the cache, never re-touching the sampler.
#[tokio::test]
async fn s2_resume_only_resamples_deleted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = controller_with(dir.path(), Arc::new(CountingReal { calls: calls.clone() }), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();
    controller.start(task_id).await.unwrap();
    wait_for_completion(&controller, task_id).await;
    assert_eq!(calls.load(Ordering::SeqCst), 20);

    let level1 = controller.cache().list(task_id, 1).await.unwrap();
    assert!(level1.len() >= 5);
    for (key, _) in level1.into_iter().take(5) {
        let path = subtile_path(dir.path(), &key);
        std::fs::remove_file(&path).expect("delete cached subtile file");
    }

    calls.store(0, Ordering::SeqCst);
    controller.start(task_id).await.unwrap();
    wait_for_completion(&controller, task_id).await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    let status = controller.status(task_id).await.unwrap();
    assert_eq!(status.counters.completed, 20);
}

/// S3: a viewer that connects mid-scan sees `grid_info` first, then
/// every one of the 20 tile results exactly once (cache replay plus
/// live handover never duplicate a key), then `done`.
#[tokio::test]
async fn s3_viewer_mid_scan_sees_every_tile_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker_count = 2;
    let controller = controller_with(dir.path(), Arc::new(SlowReal { delay: Duration::from_millis(5) }), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();
    controller.start(task_id).await.unwrap();

    // Give the scan a head start so the viewer genuinely attaches mid-flight.
    tokio::time::sleep(Duration::from_millis(15)).await;

    let limits = scanrel::broker::SessionLimits::from_config(controller.config());
    let (outbound_tx, outbound_rx) = flume::unbounded();
    let (_inbound_tx, inbound_rx) = flume::unbounded();
    let session_controller = controller.clone();
    let session = tokio::spawn(async move {
        scanrel::broker::run_session(session_controller, task_id, limits, outbound_tx, inbound_rx).await;
    });

    let mut seen: HashSet<(u32, u32, u32, u32, u32)> = HashSet::new();
    let mut first_message = true;
    let mut done = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !done {
        match tokio::time::timeout(Duration::from_millis(500), outbound_rx.recv_async()).await {
            Ok(Ok(msg)) => {
                if first_message {
                    assert!(matches!(msg, scanrel::broker::ServerMessage::GridInfo { total_subtiles: 20, .. }));
                    first_message = false;
                }
                match msg {
                    scanrel::broker::ServerMessage::Tile {
                        level, coarse_row, coarse_col, sub_row, sub_col, ..
                    } => {
                        let tile_key = (level, coarse_row, coarse_col, sub_row, sub_col);
                        assert!(seen.insert(tile_key), "duplicate tile message for {:?}", tile_key);
                    }
                    scanrel::broker::ServerMessage::Done { .. } => done = true,
                    _ => {}
                }
            }
            _ => break,
        }
    }

    assert!(done, "session should observe done");
    assert_eq!(seen.len(), 20);
    session.abort();
    wait_for_completion(&controller, task_id).await;
}

/// S4: a viewer whose outbound channel is never drained gets dropped
/// once the real (or, here, the session's own) send blocks past
/// `slow_session_timeout_ms`; the scan and any other viewer are
/// unaffected.
#[tokio::test]
async fn s4_slow_viewer_is_dropped_without_affecting_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker_count = 2;
    config.slow_session_timeout_ms = 50;
    let controller = controller_with(dir.path(), Arc::new(SlowReal { delay: Duration::from_millis(5) }), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();
    controller.start(task_id).await.unwrap();

    let limits = scanrel::broker::SessionLimits::from_config(controller.config());

    // Slow viewer: a single-slot channel, never drained, to force the
    // session's own `send` to block past `slow_timeout`.
    let (slow_tx, _slow_rx) = flume::bounded(1);
    let (_slow_inbound_tx, slow_inbound_rx) = flume::bounded(1);
    let slow_controller = controller.clone();
    let slow_session = tokio::spawn(async move {
        scanrel::broker::run_session(slow_controller, task_id, limits, slow_tx, slow_inbound_rx).await;
    });

    // Well-behaved viewer: drains normally and should still see `done`.
    let (fast_tx, fast_rx) = flume::unbounded();
    let (_fast_inbound_tx, fast_inbound_rx) = flume::unbounded();
    let fast_controller = controller.clone();
    let fast_session = tokio::spawn(async move {
        scanrel::broker::run_session(fast_controller, task_id, limits, fast_tx, fast_inbound_rx).await;
    });

    tokio::time::timeout(Duration::from_secs(2), slow_session)
        .await
        .expect("slow session should end on its own once backpressure trips")
        .unwrap();

    let mut saw_done = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), fast_rx.recv_async()).await {
            Ok(Ok(scanrel::broker::ServerMessage::Done { .. })) => {
                saw_done = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_done, "well-behaved viewer should still observe done");

    fast_session.abort();
    wait_for_completion(&controller, task_id).await;
}

/// S5: when the real elevation provider always fails, the task still
/// completes — every subtile falls back to the deterministic synthetic
/// value after `max_attempts` retries are exhausted.
#[tokio::test]
async fn s5_sampler_outage_falls_back_to_synthetic_for_every_subtile() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_attempts = 2;
    config.sampler_deadline_ms = 50;
    let max_attempts = config.max_attempts;
    let controller = controller_with(dir.path(), Arc::new(AlwaysFails), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();
    controller.start(task_id).await.unwrap();
    wait_for_completion(&controller, task_id).await;

    let mut total = 0;
    for level in 0..2 {
        let records = controller.cache().list(task_id, level).await.unwrap();
        total += records.len();
        for (_, record) in records {
            assert_eq!(record.source, Source::SyntheticFallback);
            assert_eq!(record.attempts, max_attempts + 1);
        }
    }
    assert_eq!(total, 20);
}

/// S6: once half of level 0's subtiles are cached, fetching the
/// level's snapshot renders (or returns) a PNG whose stored fingerprint
/// count tracks the number of currently cached subtiles within
/// `snapshot_regen_delta`.
#[tokio::test]
async fn s6_snapshot_fingerprint_tracks_cached_count_within_delta() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let delta = config.snapshot_regen_delta_for(4); // grid 2x2, level 0: one subtile per tile
    let calls = Arc::new(AtomicUsize::new(0));
    let controller = controller_with(dir.path(), Arc::new(CountingReal { calls }), config);

    let task_id = controller.create(small_region(), 2, Grid { rows: 2, cols: 2 }).await.unwrap();

    // Seed exactly half (2 of 4) of level 0's subtiles directly, without
    // ever starting the executor, to pin the "50% cached" precondition.
    for (tile_row, tile_col) in [(0u32, 0u32), (0, 1)] {
        let key = SubtileKey { task_id, level: 0, tile_row, tile_col, sub_row: 0, sub_col: 0 };
        let record = SubtileRecord {
            level: 0,
            subtiles_per_side: 1,
            coarse_row: tile_row,
            coarse_col: tile_col,
            sub_row: 0,
            sub_col: 0,
            center_lat: 0.005,
            center_lon: 0.005,
            elevation: Some(100.0),
            source: Source::Real,
            sampled_at: chrono::Utc::now(),
            attempts: 1,
        };
        controller.cache().put(&key, &record).await.unwrap();
    }

    let png = controller.get_or_render_snapshot(task_id, 0).await.unwrap();
    assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));

    let (_, fingerprint) = controller.cache().get_snapshot(task_id, 0).await.unwrap().unwrap();
    let actual_count = controller.cache().list(task_id, 0).await.unwrap().len() as u64;
    let diff = actual_count.abs_diff(fingerprint.count);
    assert!(
        diff <= delta,
        "fingerprint count {} should be within {} of actual {}",
        fingerprint.count,
        delta,
        actual_count
    );
}
