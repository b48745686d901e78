//! Default `CacheBackend`: a directory tree under a configurable root,
//! in the task-centric layout. Writes are atomic (write to `.tmp`, then
//! rename) so a reader never observes a partial record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::ScanError;
use crate::model::{SubtileKey, SubtileRecord, Task, TaskId};

use super::backend::{CacheBackend, SnapshotFingerprint};

pub struct FsCacheBackend {
    root: PathBuf,
}

impl FsCacheBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join("tasks").join(task_id.to_string())
    }

    fn task_json_path(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id).join("task.json")
    }

    fn subtile_path(&self, key: &SubtileKey) -> PathBuf {
        self.task_dir(key.task_id)
            .join("cache")
            .join("subtile_data")
            .join(format!("level_{}", key.level))
            .join(format!("tile_{}_{}", key.tile_row, key.tile_col))
            .join(format!("subtile_{}_{}.json", key.sub_row, key.sub_col))
    }

    fn snapshot_png_path(&self, task_id: TaskId, level: u32) -> PathBuf {
        self.task_dir(task_id)
            .join("cache")
            .join("snapshots")
            .join(format!("level_{}.png", level))
    }

    fn snapshot_fingerprint_path(&self, task_id: TaskId, level: u32) -> PathBuf {
        self.task_dir(task_id)
            .join("cache")
            .join("snapshots")
            .join(format!("level_{}.fingerprint", level))
    }

    /// Write `bytes` to `path`, creating parent directories as needed, via
    /// a temp file + rename so concurrent readers never see a partial file.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ScanError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanError::CacheErrorTransient(format!("mkdir {:?}: {e}", parent)))?;
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("write {:?}: {e}", tmp_path)))?;
        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("rename {:?}: {e}", tmp_path)))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Option<T>, ScanError> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ScanError::CacheErrorFatal(format!("corrupt record at {:?}: {e}", path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ScanError::CacheErrorTransient(format!("read {:?}: {e}", path))),
        }
    }
}

#[async_trait]
impl CacheBackend for FsCacheBackend {
    async fn put(&self, key: &SubtileKey, record: &SubtileRecord) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize record: {e}")))?;
        Self::write_atomic(&self.subtile_path(key), &bytes).await
    }

    async fn get(&self, key: &SubtileKey) -> Result<Option<SubtileRecord>, ScanError> {
        Self::read_json(&self.subtile_path(key)).await
    }

    async fn list(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Vec<(SubtileKey, SubtileRecord)>, ScanError> {
        let level_dir = self
            .task_dir(task_id)
            .join("cache")
            .join("subtile_data")
            .join(format!("level_{}", level));

        let mut results = Vec::new();
        let mut tile_dirs = match fs::read_dir(&level_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => {
                return Err(ScanError::CacheErrorTransient(format!(
                    "read_dir {:?}: {e}",
                    level_dir
                )));
            }
        };

        while let Some(tile_entry) = tile_dirs
            .next_entry()
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("read_dir entry: {e}")))?
        {
            let mut files = fs::read_dir(tile_entry.path())
                .await
                .map_err(|e| ScanError::CacheErrorTransient(format!("read_dir: {e}")))?;
            while let Some(file_entry) = files
                .next_entry()
                .await
                .map_err(|e| ScanError::CacheErrorTransient(format!("read_dir entry: {e}")))?
            {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read_json::<SubtileRecord>(&path).await {
                    Ok(Some(record)) => {
                        let key = SubtileKey {
                            task_id,
                            level: record.level,
                            tile_row: record.coarse_row,
                            tile_col: record.coarse_col,
                            sub_row: record.sub_row,
                            sub_col: record.sub_col,
                        };
                        results.push((key, record));
                    }
                    Ok(None) => {}
                    Err(ScanError::CacheErrorFatal(msg)) => {
                        tracing::warn!(path = %path.display(), %msg, "skipping corrupt cache record");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(results)
    }

    async fn put_snapshot(
        &self,
        task_id: TaskId,
        level: u32,
        bytes: &[u8],
        fingerprint: SnapshotFingerprint,
    ) -> Result<(), ScanError> {
        Self::write_atomic(&self.snapshot_png_path(task_id, level), bytes).await?;
        let fingerprint_bytes = serde_json::to_vec(&fingerprint)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize fingerprint: {e}")))?;
        Self::write_atomic(&self.snapshot_fingerprint_path(task_id, level), &fingerprint_bytes).await
    }

    async fn get_snapshot(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Option<(Vec<u8>, SnapshotFingerprint)>, ScanError> {
        let png_path = self.snapshot_png_path(task_id, level);
        let bytes = match fs::read(&png_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ScanError::CacheErrorTransient(format!("read {:?}: {e}", png_path))),
        };
        let fingerprint: SnapshotFingerprint =
            Self::read_json(&self.snapshot_fingerprint_path(task_id, level))
                .await?
                .ok_or_else(|| {
                    ScanError::CacheErrorFatal("snapshot present without fingerprint".into())
                })?;
        Ok(Some((bytes, fingerprint)))
    }

    async fn put_task(&self, task: &Task) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec_pretty(task)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize task: {e}")))?;
        Self::write_atomic(&self.task_json_path(task.task_id), &bytes).await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, ScanError> {
        Self::read_json(&self.task_json_path(task_id)).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, ScanError> {
        let tasks_dir = self.root.join("tasks");
        let mut entries = match fs::read_dir(&tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ScanError::CacheErrorTransient(format!("read_dir: {e}"))),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("read_dir entry: {e}")))?
        {
            let task_json = entry.path().join("task.json");
            if let Some(task) = Self::read_json::<Task>(&task_json).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn evict(&self, task_id: TaskId) -> Result<(), ScanError> {
        let dir = self.task_dir(task_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScanError::CacheErrorTransient(format!("remove_dir_all {:?}: {e}", dir))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::region::{Grid, Region};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_record(level: u32, tile_row: u32, tile_col: u32) -> SubtileRecord {
        SubtileRecord {
            level,
            subtiles_per_side: 1,
            coarse_row: tile_row,
            coarse_col: tile_col,
            sub_row: 0,
            sub_col: 0,
            center_lat: 45.0,
            center_lon: 9.0,
            elevation: Some(123.4),
            source: Source::Real,
            sampled_at: Utc::now(),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let task_id = Uuid::now_v7();
        let key = SubtileKey {
            task_id,
            level: 0,
            tile_row: 0,
            tile_col: 0,
            sub_row: 0,
            sub_col: 0,
        };
        let record = sample_record(0, 0, 0);

        backend.put(&key, &record).await.unwrap();
        let fetched = backend.get(&key).await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let key = SubtileKey {
            task_id: Uuid::now_v7(),
            level: 0,
            tile_row: 0,
            tile_col: 0,
            sub_row: 0,
            sub_col: 0,
        };
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_all_records_at_a_level() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let task_id = Uuid::now_v7();

        for (r, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let key = SubtileKey {
                task_id,
                level: 0,
                tile_row: r,
                tile_col: c,
                sub_row: 0,
                sub_col: 0,
            };
            backend.put(&key, &sample_record(0, r, c)).await.unwrap();
        }

        let listed = backend.list(task_id, 0).await.unwrap();
        assert_eq!(listed.len(), 4);
    }

    #[tokio::test]
    async fn nan_elevation_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let task_id = Uuid::now_v7();
        let key = SubtileKey {
            task_id,
            level: 0,
            tile_row: 0,
            tile_col: 0,
            sub_row: 0,
            sub_col: 0,
        };
        let mut record = sample_record(0, 0, 0);
        record.set_elevation(f64::NAN);
        assert_eq!(record.elevation, None);

        backend.put(&key, &record).await.unwrap();
        let fetched = backend.get(&key).await.unwrap().unwrap();
        assert!(fetched.elevation_f64().is_nan());
    }

    #[tokio::test]
    async fn task_round_trips_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let task_id = Uuid::now_v7();
        let region = Region {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        };
        let task = Task::new(task_id, region, 2, Grid { rows: 2, cols: 2 });

        backend.put_task(&task).await.unwrap();
        let fetched = backend.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task.task_id);

        let all = backend.list_tasks().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn evict_removes_everything_under_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(dir.path().to_path_buf());
        let task_id = Uuid::now_v7();
        let key = SubtileKey {
            task_id,
            level: 0,
            tile_row: 0,
            tile_col: 0,
            sub_row: 0,
            sub_col: 0,
        };
        backend.put(&key, &sample_record(0, 0, 0)).await.unwrap();
        backend.evict(task_id).await.unwrap();
        assert!(backend.get(&key).await.unwrap().is_none());
    }
}
