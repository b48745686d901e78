//! `CacheBackend` over S3-compatible object storage, for deployments
//! that point the cache at real object storage instead of a local disk.
//! Each cache key maps onto the same path layout as `FsCacheBackend`,
//! used as the S3 object key.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::ScanError;
use crate::model::{SubtileKey, SubtileRecord, Task, TaskId};

use super::backend::{CacheBackend, SnapshotFingerprint};

pub struct S3CacheBackend {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3CacheBackend {
    pub fn new(client: S3Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    fn object_key(&self, relative: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), relative)
    }

    fn subtile_object_key(&self, key: &SubtileKey) -> String {
        self.object_key(&format!(
            "tasks/{}/cache/subtile_data/level_{}/tile_{}_{}/subtile_{}_{}.json",
            key.task_id, key.level, key.tile_row, key.tile_col, key.sub_row, key.sub_col
        ))
    }

    fn task_object_key(&self, task_id: TaskId) -> String {
        self.object_key(&format!("tasks/{}/task.json", task_id))
    }

    fn snapshot_png_key(&self, task_id: TaskId, level: u32) -> String {
        self.object_key(&format!(
            "tasks/{}/cache/snapshots/level_{}.png",
            task_id, level
        ))
    }

    fn snapshot_fingerprint_key(&self, task_id: TaskId, level: u32) -> String {
        self.object_key(&format!(
            "tasks/{}/cache/snapshots/level_{}.fingerprint",
            task_id, level
        ))
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), ScanError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("put_object {key}: {e}")))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, ScanError> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| ScanError::CacheErrorTransient(format!("read body {key}: {e}")))?
                    .into_bytes()
                    .to_vec();
                Ok(Some(bytes))
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(ScanError::CacheErrorTransient(format!("get_object {key}: {err}"))),
        }
    }
}

fn is_not_found(err: &aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>) -> bool {
    matches!(
        err,
        aws_sdk_s3::error::SdkError::ServiceError(service_err)
            if service_err.err().is_no_such_key()
    )
}

#[async_trait]
impl CacheBackend for S3CacheBackend {
    async fn put(&self, key: &SubtileKey, record: &SubtileRecord) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize record: {e}")))?;
        self.put_object(&self.subtile_object_key(key), bytes).await
    }

    async fn get(&self, key: &SubtileKey) -> Result<Option<SubtileRecord>, ScanError> {
        match self.get_object(&self.subtile_object_key(key)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ScanError::CacheErrorFatal(format!("corrupt record: {e}"))),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Vec<(SubtileKey, SubtileRecord)>, ScanError> {
        let prefix = self.object_key(&format!(
            "tasks/{}/cache/subtile_data/level_{}/",
            task_id, level
        ));

        let mut results = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| ScanError::CacheErrorTransient(format!("list_objects_v2: {e}")))?;

            for object in output.contents() {
                let Some(object_key) = object.key() else { continue };
                if !object_key.ends_with(".json") {
                    continue;
                }
                if let Some(bytes) = self.get_object(object_key).await? {
                    match serde_json::from_slice::<SubtileRecord>(&bytes) {
                        Ok(record) => {
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
                        Err(e) => {
                            tracing::warn!(object_key, %e, "skipping corrupt cache record");
                        }
                    }
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
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
        self.put_object(&self.snapshot_png_key(task_id, level), bytes.to_vec()).await?;
        let fingerprint_bytes = serde_json::to_vec(&fingerprint)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize fingerprint: {e}")))?;
        self.put_object(&self.snapshot_fingerprint_key(task_id, level), fingerprint_bytes)
            .await
    }

    async fn get_snapshot(
        &self,
        task_id: TaskId,
        level: u32,
    ) -> Result<Option<(Vec<u8>, SnapshotFingerprint)>, ScanError> {
        let Some(png_bytes) = self.get_object(&self.snapshot_png_key(task_id, level)).await? else {
            return Ok(None);
        };
        let fingerprint_bytes = self
            .get_object(&self.snapshot_fingerprint_key(task_id, level))
            .await?
            .ok_or_else(|| ScanError::CacheErrorFatal("snapshot present without fingerprint".into()))?;
        let fingerprint = serde_json::from_slice(&fingerprint_bytes)
            .map_err(|e| ScanError::CacheErrorFatal(format!("corrupt fingerprint: {e}")))?;
        Ok(Some((png_bytes, fingerprint)))
    }

    async fn put_task(&self, task: &Task) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec(task)
            .map_err(|e| ScanError::CacheErrorFatal(format!("serialize task: {e}")))?;
        self.put_object(&self.task_object_key(task.task_id), bytes).await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, ScanError> {
        match self.get_object(&self.task_object_key(task_id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ScanError::CacheErrorFatal(format!("corrupt task: {e}"))),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, ScanError> {
        let prefix = self.object_key("tasks/");
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .delimiter("/")
            .send()
            .await
            .map_err(|e| ScanError::CacheErrorTransient(format!("list_objects_v2: {e}")))?;

        let mut tasks = Vec::new();
        for common_prefix in output.common_prefixes() {
            let Some(task_prefix) = common_prefix.prefix() else { continue };
            let Some(task_id_str) = task_prefix
                .trim_start_matches(&prefix)
                .trim_end_matches('/')
                .split('/')
                .next()
            else {
                continue;
            };
            if let Ok(task_id) = task_id_str.parse() {
                if let Some(task) = self.get_task(task_id).await? {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    async fn evict(&self, task_id: TaskId) -> Result<(), ScanError> {
        let prefix = self.object_key(&format!("tasks/{}/", task_id));
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| ScanError::CacheErrorTransient(format!("list_objects_v2: {e}")))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| ScanError::CacheErrorTransient(format!("delete_object {key}: {e}")))?;
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }
        Ok(())
    }
}
