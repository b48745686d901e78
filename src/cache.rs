mod backend;
mod fs_backend;
mod s3_backend;

pub use backend::{CacheBackend, SnapshotFingerprint};
pub use fs_backend::FsCacheBackend;
pub use s3_backend::S3CacheBackend;
