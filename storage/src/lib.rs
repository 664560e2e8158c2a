//! # Storage backends
//!
//! Configuration and unification for the blob storage backends used by the
//! registry.

use std::sync::Arc;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Storage backend selection, as it appears in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "driver")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory {
        /// Bucket to create up-front.
        bucket: String,
    },

    /// Store objects below a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory.
        path: Utf8PathBuf,
    },

    /// Store objects in a temporary directory, removed on shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured storage backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|err| StorageError::io("temp", err))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }

    /// List objects, optionally below a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}

/// A storage handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The bucket name.
    pub fn name(&self) -> &str {
        &self.bucket
    }

    /// Get the metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Check whether an object exists.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Read an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await?;
        Ok(())
    }

    /// Write an object from `reader`.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await?;
        Ok(())
    }

    /// List objects, optionally below a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    /// Delete an object. Missing objects are ignored.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=%self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_handle_round_trip() {
        let storage: Storage = MemoryStorage::with_buckets(&["test"]).into();
        let bucket = storage.bucket("test");
        let path = Utf8Path::new("images/abc/json");

        assert!(!bucket.exists(path).await.unwrap());

        let mut reader = io::BufReader::new(&b"{}"[..]);
        bucket.upload(path, &mut reader).await.unwrap();
        assert!(bucket.exists(path).await.unwrap());
        assert_eq!(bucket.metadata(path).await.unwrap().size, 2);

        let mut data = Vec::new();
        bucket.download(path, &mut data).await.unwrap();
        assert_eq!(data, b"{}");

        bucket.delete(path).await.unwrap();
        assert!(!bucket.exists(path).await.unwrap());
    }

    #[tokio::test]
    async fn memory_config_builds_bucket() {
        let config = StorageConfig::Memory {
            bucket: "registry".into(),
        };
        let storage = config.build().await.unwrap();
        assert_eq!(storage.name(), "memory");
        let listed = storage.list("registry", None).await.unwrap();
        assert!(listed.is_empty());
    }
}
