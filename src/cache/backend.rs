//! Subtile Cache (C2): durable key→value store for subtile records,
//! snapshot blobs, and task metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::model::{SubtileKey, SubtileRecord, Task, TaskId};

/// `{count, max_sampled_at}` fingerprint of a snapshot's inputs, used to
/// decide when a level's PNG needs regenerating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFingerprint {
    pub count: u64,
    pub max_sampled_at: Option<DateTime<Utc>>,
}

/// Storage-adapter seam for the Subtile Cache. A successful `put` must be
/// visible to any subsequent `get` (read-your-writes); multiple writers
/// for the same key are tolerated and idempotent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn put(&self, key: &SubtileKey, record: &SubtileRecord) -> Result<(), ScanError>;
    async fn get(&self, key: &SubtileKey) -> Result<Option<SubtileRecord>, ScanError>;
    async fn list(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Vec<(SubtileKey, SubtileRecord)>, ScanError>;

    async fn put_snapshot(
        &self,
        task_id: TaskId,
        level: u32,
        bytes: &[u8],
        fingerprint: SnapshotFingerprint,
    ) -> Result<(), ScanError>;
    async fn get_snapshot(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Option<(Vec<u8>, SnapshotFingerprint)>, ScanError>;

    async fn put_task(&self, task: &Task) -> Result<(), ScanError>;
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, ScanError>;
    async fn list_tasks(&self) -> Result<Vec<Task>, ScanError>;

    async fn evict(&self, task_id: TaskId) -> Result<(), ScanError>;
}
