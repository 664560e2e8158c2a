use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that keeps objects in memory.
///
/// Uploads are buffered completely before they become visible, so an upload
/// which fails part way leaves the previous object untouched.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    fn missing_bucket(&self, bucket: &str) -> StorageError {
        StorageError::not_found(self.name(), bucket, None)
    }

    fn missing_path(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::not_found(self.name(), bucket, Some(remote.as_str()))
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| self.missing_path(bucket, remote))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Copy out under the read lock, then write without holding it.
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets
                .get(bucket)
                .ok_or_else(|| self.missing_bucket(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| self.missing_path(bucket, remote))?
                .as_ref()
                .to_vec()
        };

        local
            .write_all(&data)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.missing_bucket(bucket))?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn put(storage: &MemoryStorage, path: &str, data: &[u8]) {
        let mut reader = data;
        storage
            .upload("test", Utf8Path::new(path), &mut reader)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upload_replaces_previous_object() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "images/a/layer", b"first").await;
        put(&storage, "images/a/layer", b"second!").await;

        let mut out = Vec::new();
        storage
            .download("test", Utf8Path::new("images/a/layer"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"second!");

        let meta = storage
            .metadata("test", Utf8Path::new("images/a/layer"))
            .await
            .unwrap();
        assert_eq!(meta.size, 7);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let storage = MemoryStorage::with_buckets(&["test"]);

        let err = storage
            .metadata("test", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = storage
            .metadata("other", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert!(!storage.exists("test", Utf8Path::new("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let storage = MemoryStorage::with_buckets(&["test"]);
        put(&storage, "repositories/ns/a/tags/latest", b"x").await;
        put(&storage, "repositories/ns/a/tags/v1", b"y").await;
        put(&storage, "repositories/ns/b/tags/latest", b"z").await;

        let listed = storage
            .list("test", Some(Utf8Path::new("repositories/ns/a/tags")))
            .await
            .unwrap();
        assert_eq!(
            listed,
            vec![
                "repositories/ns/a/tags/latest".to_string(),
                "repositories/ns/a/tags/v1".to_string(),
            ]
        );
    }
}
