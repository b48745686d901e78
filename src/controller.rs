//! Task Controller (C7): task lifecycle, binding the Scan Planner, Scan
//! Executor, and Session Broker together behind one owned `Service`
//! value, following the corpus's pattern of tracking spawned background
//! work in a handle map so `stop` can await cooperative shutdown rather
//! than leaking tasks (the same shape as the corpus's stream-lifecycle
//! manager, here applied to scan tasks instead of ingest streams).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::cache::CacheBackend;
use crate::config::Config;
use crate::elevation::ElevationSampler;
use crate::error::ScanError;
use crate::executor::{AtomicCounters, ExecutionControl, Executor, FailureSlot};
use crate::model::{LastError, Task, TaskCounters, TaskId, TaskStatus};
use crate::region::{Grid, Region};
use crate::schedule::{ScheduleCursor, build_schedule};
use crate::snapshot::{SnapshotRenderer, fingerprint_of, needs_regen};

/// In-memory bookkeeping for a task whose executor may be running. Tasks
/// not currently running (just created, or loaded from cache on another
/// process) have no entry here; the durable `Task` in the cache is always
/// the source of truth for status between restarts.
struct RunningTask {
    counters: Arc<AtomicCounters>,
    control: Arc<ExecutionControl>,
    executor_handle: Option<JoinHandle<()>>,
    snapshot_handle: Option<JoinHandle<()>>,
}

pub struct Status {
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub last_error: Option<String>,
}

/// Binds C3 (planner), C4 (executor), and the bus; owns task lifecycle.
/// One `TaskController` is constructed once at process startup and
/// passed by reference into the CLI and HTTP/WebSocket layers — there is
/// no module-level singleton.
pub struct TaskController {
    cache: Arc<dyn CacheBackend>,
    bus: Arc<Bus>,
    sampler: Arc<ElevationSampler>,
    renderer: Arc<dyn SnapshotRenderer>,
    config: Config,
    running: Arc<DashMap<TaskId, RunningTask>>,
}

impl TaskController {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        bus: Arc<Bus>,
        sampler: Arc<ElevationSampler>,
        renderer: Arc<dyn SnapshotRenderer>,
        config: Config,
    ) -> Self {
        Self {
            cache,
            bus,
            sampler,
            renderer,
            config,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn cache(&self) -> Arc<dyn CacheBackend> {
        self.cache.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates the region and grid, then creates a task in `pending`.
    /// `InvalidConfig`/`InvalidRegion` are rejected here — the task never
    /// reaches `pending` on bad input.
    pub async fn create(
        &self,
        region: Region,
        levels: u32,
        grid: Grid,
    ) -> Result<TaskId, ScanError> {
        region.validate()?;
        grid.validate()?;
        if levels == 0 {
            return Err(ScanError::InvalidConfig("levels must be at least 1".into()));
        }

        let task_id = Uuid::now_v7();
        let task = Task::new(task_id, region, levels, grid);
        self.cache.put_task(&task).await?;
        info!(task_id = %task_id, "task created");
        Ok(task_id)
    }

    /// Starts (or resumes) a task: builds the schedule, skips keys
    /// already durable in the cache (resumability), and launches the
    /// executor and snapshot-regeneration loop as tracked background
    /// tasks.
    #[instrument(skip(self))]
    pub async fn start(&self, task_id: TaskId) -> Result<(), ScanError> {
        let mut task = self
            .cache
            .get_task(task_id)
            .await?
            .ok_or_else(|| ScanError::InvalidConfig(format!("unknown task {task_id}")))?;

        if matches!(task.status, TaskStatus::Completed) {
            return Ok(());
        }

        let grid = task.grid;
        let schedule = build_schedule(task_id, grid, task.levels);
        let total = schedule.len() as u64;

        // Resumability: skip any key already durable in the cache.
        let mut cached_keys = HashSet::new();
        for level in 0..task.levels {
            for (key, _) in self.cache.list(task_id, level).await? {
                cached_keys.insert(key);
            }
        }
        let remaining: Vec<_> = schedule.into_iter().filter(|k| !cached_keys.contains(k)).collect();
        let already_done = total - remaining.len() as u64;

        let counters = Arc::new(AtomicCounters::default());
        counters.scheduled.store(total, std::sync::atomic::Ordering::SeqCst);
        counters.completed.store(already_done, std::sync::atomic::Ordering::SeqCst);

        let control = Arc::new(ExecutionControl::new());
        let failure = Arc::new(FailureSlot::default());
        let cursor = Arc::new(ScheduleCursor::new(remaining));

        task.status = TaskStatus::Running;
        task.updated_at = Utc::now();
        self.cache.put_task(&task).await?;

        let executor = Executor::new(
            self.cache.clone(),
            self.bus.clone(),
            self.sampler.clone(),
            self.config.max_attempts,
            Duration::from_millis(self.config.sampler_deadline_ms),
        );

        let region = task.region;
        let levels = task.levels;
        let worker_count = self.config.worker_count;
        let cache_for_executor = self.cache.clone();
        let control_for_executor = control.clone();
        let counters_for_executor = counters.clone();
        let failure_for_executor = failure.clone();
        let running_for_executor = self.running.clone();

        let executor_handle = tokio::spawn(async move {
            executor
                .run(
                    task_id,
                    region,
                    grid,
                    cursor,
                    counters_for_executor.clone(),
                    control_for_executor,
                    failure_for_executor.clone(),
                    worker_count,
                )
                .await;
            finalize_task(&cache_for_executor, task_id, &counters_for_executor, &failure_for_executor).await;
            // Natural completion (not a `stop`, which already removed this
            // entry before awaiting the handle): drop the bookkeeping entry
            // and reflect it in the running-task gauge.
            running_for_executor.remove(&task_id);
            metrics::gauge!("scan_tasks_running").set(running_for_executor.len() as f64);
        });

        let snapshot_handle = self.spawn_snapshot_loop(task_id, grid, levels, control.clone());

        self.running.insert(
            task_id,
            RunningTask {
                counters,
                control,
                executor_handle: Some(executor_handle),
                snapshot_handle: Some(snapshot_handle),
            },
        );
        metrics::gauge!("scan_tasks_running").set(self.running.len() as f64);
        Ok(())
    }

    /// Cooperative pause: the schedule iterator and in-flight writes are
    /// left untouched; workers halt between subtiles.
    pub async fn pause(&self, task_id: TaskId) -> Result<(), ScanError> {
        if let Some(running) = self.running.get(&task_id) {
            running.control.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        self.set_status(task_id, TaskStatus::Paused).await
    }

    pub async fn resume(&self, task_id: TaskId) -> Result<(), ScanError> {
        if self.running.contains_key(&task_id) {
            if let Some(running) = self.running.get(&task_id) {
                running.control.paused.store(false, std::sync::atomic::Ordering::SeqCst);
            }
            self.set_status(task_id, TaskStatus::Running).await
        } else {
            // No in-memory executor (e.g. resumed after a crash): start fresh.
            self.start(task_id).await
        }
    }

    /// Stops a task: workers drain cooperatively and the schedule is
    /// frozen. Awaits the executor's shutdown before returning.
    pub async fn stop(&self, task_id: TaskId) -> Result<(), ScanError> {
        if let Some((_, mut running)) = self.running.remove(&task_id) {
            running.control.cancel.cancel();
            if let Some(handle) = running.executor_handle.take() {
                let _ = handle.await;
            }
            if let Some(handle) = running.snapshot_handle.take() {
                handle.abort();
            }
            metrics::gauge!("scan_tasks_running").set(self.running.len() as f64);
        }
        self.set_status(task_id, TaskStatus::Stopped).await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<Status, ScanError> {
        let task = self
            .cache
            .get_task(task_id)
            .await?
            .ok_or_else(|| ScanError::InvalidConfig(format!("unknown task {task_id}")))?;

        let counters = match self.running.get(&task_id) {
            Some(running) => running.counters.snapshot(),
            None => task.counters,
        };

        Ok(Status {
            status: task.status,
            counters,
            last_error: task.last_error.map(|e| e.message),
        })
    }

    pub async fn list(&self) -> Result<Vec<Task>, ScanError> {
        self.cache.list_tasks().await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, ScanError> {
        self.cache
            .get_task(task_id)
            .await?
            .ok_or_else(|| ScanError::InvalidConfig(format!("unknown task {task_id}")))
    }

    /// Returns the cached snapshot PNG for `(task_id, level)`, rendering
    /// and caching one first if none exists yet.
    pub async fn get_or_render_snapshot(&self, task_id: TaskId, level: u32) -> Result<Vec<u8>, ScanError> {
        if let Some((bytes, _)) = self.cache.get_snapshot(task_id, level).await? {
            return Ok(bytes);
        }
        let task = self.get_task(task_id).await?;
        let grid = task.grid;
        let records = self.cache.list(task_id, level).await?;
        let fingerprint = fingerprint_of(&records);
        let png = self.renderer.render(grid, level, &records).await?;
        self.cache.put_snapshot(task_id, level, &png, fingerprint).await?;
        metrics::counter!("scan_snapshot_regenerations_total").increment(1);
        Ok(png)
    }

    async fn set_status(&self, task_id: TaskId, status: TaskStatus) -> Result<(), ScanError> {
        let mut task = self
            .cache
            .get_task(task_id)
            .await?
            .ok_or_else(|| ScanError::InvalidConfig(format!("unknown task {task_id}")))?;
        task.status = status;
        task.updated_at = Utc::now();
        self.cache.put_task(&task).await
    }

    /// Background loop: periodically checks whether each level's cached
    /// subtile set has grown enough to warrant re-rendering its snapshot,
    /// per the `Δn` threshold in the external interfaces table.
    fn spawn_snapshot_loop(
        &self,
        task_id: TaskId,
        grid: Grid,
        levels: u32,
        control: Arc<ExecutionControl>,
    ) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let renderer = self.renderer.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut last_fingerprint = vec![None; levels as usize];
            loop {
                if control.cancel.is_cancelled() {
                    return;
                }
                for level in 0..levels {
                    let records = match cache.list(task_id, level).await {
                        Ok(r) => r,
                        Err(err) => {
                            warn!(task_id = %task_id, level, %err, "snapshot loop: list failed");
                            continue;
                        }
                    };
                    let fingerprint = fingerprint_of(&records);
                    let idx = level as usize;
                    let total_at_level = grid.tile_count() as u64
                        * crate::region::subtiles_per_side(level) as u64
                        * crate::region::subtiles_per_side(level) as u64;
                    let delta = config.snapshot_regen_delta_for(total_at_level);

                    if needs_regen(last_fingerprint[idx].as_ref(), &fingerprint, delta) {
                        match renderer.render(grid, level, &records).await {
                            Ok(png) => {
                                if let Err(err) =
                                    cache.put_snapshot(task_id, level, &png, fingerprint).await
                                {
                                    warn!(task_id = %task_id, level, %err, "snapshot put failed");
                                } else {
                                    last_fingerprint[idx] = Some(fingerprint);
                                    metrics::counter!("scan_snapshot_regenerations_total").increment(1);
                                }
                            }
                            Err(err) => {
                                warn!(task_id = %task_id, level, %err, "snapshot render failed");
                            }
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
    }
}

/// Called once the executor has drained its cursor. Marks the task
/// `completed` if counters show every scheduled key is accounted for;
/// otherwise `failed`, with `last_error` populated from the `FailureSlot`
/// the workers recorded their triggering `ScanError` into, per spec §7
/// ("User-visible task status carries `last_error` ... on `failed`
/// only").
async fn finalize_task(
    cache: &Arc<dyn CacheBackend>,
    task_id: TaskId,
    counters: &Arc<AtomicCounters>,
    failure: &Arc<FailureSlot>,
) {
    let Ok(Some(mut task)) = cache.get_task(task_id).await else {
        return;
    };
    if matches!(task.status, TaskStatus::Stopped | TaskStatus::Paused) {
        return;
    }
    let snapshot = counters.snapshot();
    task.counters = snapshot.clone();
    task.status = if snapshot.completed >= snapshot.scheduled {
        TaskStatus::Completed
    } else {
        task.last_error = failure.take().or_else(|| {
            Some(LastError {
                kind: "Unavailable".into(),
                message: "scan ended before every scheduled key was accounted for".into(),
            })
        });
        TaskStatus::Failed
    };
    task.updated_at = Utc::now();
    let _ = cache.put_task(&task).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsCacheBackend;
    use crate::elevation::ElevationProvider;
    use crate::snapshot::ImageSnapshotRenderer;
    use async_trait::async_trait;

    struct AlwaysReal(f64);

    #[async_trait]
    impl ElevationProvider for AlwaysReal {
        async fn sample_real(&self, _lat: f64, _lon: f64, _resolution_m: f64) -> Result<f64, ScanError> {
            Ok(self.0)
        }
    }

    fn test_region() -> Region {
        Region {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        }
    }

    fn test_controller(dir: &std::path::Path) -> TaskController {
        let cache: Arc<dyn CacheBackend> = Arc::new(FsCacheBackend::new(dir.to_path_buf()));
        let bus = Arc::new(Bus::new(256));
        let sampler = Arc::new(ElevationSampler::new(Arc::new(AlwaysReal(100.0))));
        let renderer: Arc<dyn SnapshotRenderer> = Arc::new(ImageSnapshotRenderer::default());
        let mut config = Config::default();
        config.grid_y = 2;
        config.grid_x = 2;
        config.levels = 2;
        config.worker_count = 4;
        TaskController::new(cache, bus, sampler, renderer, config)
    }

    #[tokio::test]
    async fn create_rejects_invalid_region() {
        let dir = tempfile::tempdir().unwrap();
        let controller = test_controller(dir.path());
        let bad_region = Region {
            lat_min: 1.0,
            lat_max: 0.0,
            lon_min: 0.0,
            lon_max: 1.0,
        };
        let err = controller
            .create(bad_region, 2, Grid { rows: 2, cols: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidRegion(_)));
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let controller = test_controller(dir.path());
        let task_id = controller
            .create(test_region(), 2, Grid { rows: 2, cols: 2 })
            .await
            .unwrap();

        controller.start(task_id).await.unwrap();

        // Give the spawned executor/finalize a moment to run.
        for _ in 0..200 {
            let status = controller.status(task_id).await.unwrap();
            if matches!(status.status, TaskStatus::Completed) {
                assert_eq!(status.counters.completed, 20);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task did not reach completed in time");
    }

    #[tokio::test]
    async fn resume_after_partial_cache_only_samples_remaining_keys() {
        let dir = tempfile::tempdir().unwrap();
        let controller = test_controller(dir.path());
        let task_id = controller
            .create(test_region(), 1, Grid { rows: 1, cols: 1 })
            .await
            .unwrap();

        // Pre-seed the only key so start() should treat it as already done.
        let key = crate::model::SubtileKey {
            task_id,
            level: 0,
            tile_row: 0,
            tile_col: 0,
            sub_row: 0,
            sub_col: 0,
        };
        let record = crate::model::SubtileRecord {
            level: 0,
            subtiles_per_side: 1,
            coarse_row: 0,
            coarse_col: 0,
            sub_row: 0,
            sub_col: 0,
            center_lat: 0.5,
            center_lon: 0.5,
            elevation: Some(10.0),
            source: crate::model::Source::Real,
            sampled_at: Utc::now(),
            attempts: 1,
        };
        controller.cache().put(&key, &record).await.unwrap();

        controller.start(task_id).await.unwrap();

        for _ in 0..200 {
            let status = controller.status(task_id).await.unwrap();
            if matches!(status.status, TaskStatus::Completed) {
                assert_eq!(status.counters.completed, 1);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task did not reach completed in time");
    }
}
