use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Storage driver that keeps objects as files below a root directory.
///
/// Uploads are written to a temporary file outside the bucket tree and
/// renamed into place, so readers and listings never observe a partially
/// written object.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    /// In-flight uploads for `bucket`. A sibling of the bucket tree, so it
    /// shares a filesystem with it and never appears in a listing.
    fn partial_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("partial");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if remote.is_absolute()
            || remote
                .components()
                .any(|c| matches!(c, camino::Utf8Component::ParentDir))
        {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                format!("path escapes bucket: {remote}"),
            )
            .bucket(bucket)
            .build());
        }

        Ok(self.bucket_root(bucket).join(remote))
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, err: eyre::Report) -> StorageError {
        let kind = match err.downcast_ref::<std::io::Error>().map(|e| e.kind()) {
            Some(std::io::ErrorKind::NotFound) => StorageErrorKind::NotFound,
            Some(std::io::ErrorKind::PermissionDenied) => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(self.name(), kind, err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .wrap_err("local driver: metadata")
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .modified()
                .wrap_err("local driver: modified timestamp")
                .map_err(|err| self.error(bucket, remote, err))?
                .into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.error(
                bucket,
                remote,
                eyre::Report::new(err).wrap_err("remove_file"),
            )),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        let parent = path.parent().unwrap_or(self.root.as_path()).to_owned();
        let partial_root = self.partial_root(bucket);
        let partial = partial_root.join(uuid::Uuid::new_v4().simple().to_string());

        for dir in [&parent, &partial_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .wrap_err("create_dir_all")
                .map_err(|err| self.error(bucket, remote, err))?;
        }

        let written = async {
            let mut writer = tokio::io::BufWriter::new(
                tokio::fs::File::create(&partial)
                    .await
                    .wrap_err("local: create partial file")?,
            );

            tokio::io::copy(local, &mut writer)
                .await
                .wrap_err("copy")?;

            writer.shutdown().await.wrap_err("shutdown writer")?;
            tokio::fs::rename(&partial, &path)
                .await
                .wrap_err("rename into place")?;
            Ok::<_, eyre::Report>(())
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(self.error(bucket, remote, err));
        }

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .wrap_err("open remote file")
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .wrap_err("copy")
            .map_err(|err| self.error(bucket, remote, err))?;

        local
            .flush()
            .await
            .wrap_err("flush writer")
            .map_err(|err| self.error(bucket, remote, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket);
        let start = match prefix {
            Some(prefix) => self.path(bucket, prefix)?,
            None => root.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(|err| StorageError::new("local", StorageErrorKind::Io, err))?
            .map_err(|err| StorageError::new("local", StorageErrorKind::Io, err))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut files = Vec::new();
    if start.is_dir() {
        visit(start, &mut files)?;
    }

    let mut items: Vec<String> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect();
    items.sort();
    Ok(items)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
