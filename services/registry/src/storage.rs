//! Storage layout for the registry

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::checksum::{Algorithm, Checksum, Hasher};
use crate::error::{RegistryError, RegistryResult};
use crate::name::RepositoryName;

/// Registry storage backend
///
/// Objects are laid out as:
///
/// ```text
/// images/<id>/json
/// images/<id>/layer
/// images/<id>/record.json
/// repositories/<namespace>/<name>/record.json
/// repositories/<namespace>/<name>/tags/<tag>
/// ```
///
/// Every write replaces the whole object, so a failed write leaves the
/// previous version in place.
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    bucket: storage::StorageBucket,
}

impl RegistryStorage {
    /// Create a new registry storage
    pub fn new(storage: storage::Storage, bucket: impl Into<String>) -> Self {
        Self {
            bucket: storage.bucket(bucket),
        }
    }

    /// Name of the bucket holding registry objects
    pub fn bucket(&self) -> &str {
        self.bucket.name()
    }

    pub(crate) fn image_json_path(id: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("images/{id}/json"))
    }

    pub(crate) fn layer_path(id: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("images/{id}/layer"))
    }

    pub(crate) fn image_record_path(id: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("images/{id}/record.json"))
    }

    pub(crate) fn repository_record_path(name: &RepositoryName) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "repositories/{}/{}/record.json",
            name.namespace(),
            name.name()
        ))
    }

    pub(crate) fn tags_prefix(name: &RepositoryName) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "repositories/{}/{}/tags",
            name.namespace(),
            name.name()
        ))
    }

    pub(crate) fn tag_path(name: &RepositoryName, tag: &str) -> Utf8PathBuf {
        Self::tags_prefix(name).join(tag)
    }

    /// Read an object, returning `None` when it does not exist.
    pub async fn read(&self, path: &Utf8Path) -> RegistryResult<Option<Bytes>> {
        let mut data = Vec::new();
        match self.bucket.download(path, &mut data).await {
            Ok(()) => Ok(Some(data.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace an object with `data`.
    pub async fn write(&self, path: &Utf8Path, data: &[u8]) -> RegistryResult<()> {
        let mut reader = data;
        self.bucket.upload(path, &mut reader).await?;
        Ok(())
    }

    /// Read and decode a JSON record, returning `None` when it does not exist.
    pub async fn read_record<T: DeserializeOwned>(
        &self,
        path: &Utf8Path,
    ) -> RegistryResult<Option<T>> {
        let Some(data) = self.read(path).await? else {
            return Ok(None);
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| RegistryError::CorruptRecord(format!("{path}: {err}")))
    }

    /// Encode and store a JSON record.
    pub async fn write_record<T: Serialize>(&self, path: &Utf8Path, record: &T) -> RegistryResult<()> {
        let data = serde_json::to_vec(record)
            .map_err(|err| RegistryError::CorruptRecord(format!("{path}: {err}")))?;
        self.write(path, &data).await
    }

    /// Stream an object through a hasher, returning `None` when it does not
    /// exist.
    pub async fn checksum(
        &self,
        path: &Utf8Path,
        algorithm: Algorithm,
    ) -> RegistryResult<Option<Checksum>> {
        let mut hasher = Hasher::new(algorithm);
        match self.bucket.download(path, &mut hasher).await {
            Ok(()) => {
                tracing::trace!(%path, bytes = hasher.written(), "hashed object");
                Ok(Some(hasher.finish()))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Size of an object, returning `None` when it does not exist.
    pub async fn size(&self, path: &Utf8Path) -> RegistryResult<Option<u64>> {
        match self.bucket.metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.size)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// List the objects below `prefix`. A missing prefix lists as empty.
    pub async fn list(&self, prefix: &Utf8Path) -> RegistryResult<Vec<String>> {
        match self.bucket.list(Some(prefix)).await {
            Ok(items) => Ok(items),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete an object. Missing objects are ignored.
    pub async fn delete(&self, path: &Utf8Path) -> RegistryResult<()> {
        self.bucket.delete(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    fn test_storage() -> RegistryStorage {
        let storage: storage::Storage = MemoryStorage::with_buckets(&["test"]).into();
        RegistryStorage::new(storage, "test")
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        value: u32,
    }

    #[tokio::test]
    async fn test_bytes() {
        let storage = test_storage();
        let path = RegistryStorage::layer_path("abc");

        assert_eq!(storage.read(&path).await.unwrap(), None);
        assert_eq!(storage.size(&path).await.unwrap(), None);

        storage.write(&path, b"layer data").await.unwrap();
        assert_eq!(
            storage.read(&path).await.unwrap().as_deref(),
            Some(&b"layer data"[..])
        );
        assert_eq!(storage.size(&path).await.unwrap(), Some(10));

        storage.delete(&path).await.unwrap();
        assert_eq!(storage.read(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_records() {
        let storage = test_storage();
        let path = RegistryStorage::image_record_path("abc");

        let missing: Option<Record> = storage.read_record(&path).await.unwrap();
        assert!(missing.is_none());

        storage.write_record(&path, &Record { value: 7 }).await.unwrap();
        let record: Option<Record> = storage.read_record(&path).await.unwrap();
        assert_eq!(record, Some(Record { value: 7 }));

        storage.write(&path, b"garbage").await.unwrap();
        let err = storage.read_record::<Record>(&path).await.unwrap_err();
        assert!(matches!(err, RegistryError::CorruptRecord(_)));
    }

    #[tokio::test]
    async fn test_checksum_streams_object() {
        let storage = test_storage();
        let path = RegistryStorage::layer_path("abc");
        storage.write(&path, b"layer data").await.unwrap();

        let checksum = storage
            .checksum(&path, Algorithm::Sha256)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checksum, Checksum::sha256(b"layer data"));

        let missing = RegistryStorage::layer_path("nope");
        assert!(
            storage
                .checksum(&missing, Algorithm::Sha256)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_tags() {
        let storage = test_storage();
        let name = RepositoryName::new("library", "busybox").unwrap();
        let other = RepositoryName::new("library", "busybox2").unwrap();

        assert!(
            storage
                .list(&RegistryStorage::tags_prefix(&name))
                .await
                .unwrap()
                .is_empty()
        );

        storage
            .write(&RegistryStorage::tag_path(&name, "latest"), b"abc")
            .await
            .unwrap();
        storage
            .write(&RegistryStorage::tag_path(&other, "latest"), b"def")
            .await
            .unwrap();

        let listed = storage
            .list(&RegistryStorage::tags_prefix(&name))
            .await
            .unwrap();
        assert_eq!(listed, vec!["repositories/library/busybox/tags/latest"]);
    }
}
