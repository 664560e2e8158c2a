//! Repository records, tags, and the finalize gate.

use std::collections::BTreeMap;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::image::Images;
use crate::locks::KeyedLocks;
use crate::name::{RepositoryName, validate_image_id};
use crate::storage::RegistryStorage;

/// The durable state of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    namespace: String,
    name: String,
    descriptor: serde_json::Value,
    images: Vec<String>,
    upload_completed: bool,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl RepositoryRecord {
    /// The repository name
    pub fn name(&self) -> RegistryResult<RepositoryName> {
        RepositoryName::new(self.namespace.as_str(), self.name.as_str())
    }

    /// The most recent descriptor sent by a client
    pub fn descriptor(&self) -> &serde_json::Value {
        &self.descriptor
    }

    /// Ids of every image pushed to this repository, in the order first seen
    pub fn images(&self) -> &[String] {
        &self.images
    }

    /// Whether a push of this repository has been finalized
    pub fn upload_completed(&self) -> bool {
        self.upload_completed
    }

    /// When the repository was created
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When the record last changed
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    fn add_image(&mut self, id: &str) -> bool {
        if self.images.iter().any(|existing| existing == id) {
            false
        } else {
            self.images.push(id.to_string());
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagRecord {
    image_id: String,
    updated: DateTime<Utc>,
}

/// Read image ids out of a repository descriptor.
///
/// Clients send a list of `{"id": ...}` objects. Plain id strings are also
/// accepted. Anything other than a list is rejected.
fn descriptor_image_ids(descriptor: &serde_json::Value) -> RegistryResult<Vec<String>> {
    let Some(entries) = descriptor.as_array() else {
        return Err(RegistryError::InvalidMetadata(
            "repository descriptor must be a list of images".to_string(),
        ));
    };

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = match entry {
            serde_json::Value::String(id) => Some(id.as_str()),
            serde_json::Value::Object(fields) => fields.get("id").and_then(|id| id.as_str()),
            _ => None,
        };

        let Some(id) = id else {
            return Err(RegistryError::InvalidMetadata(format!(
                "repository descriptor entry has no image id: {entry}"
            )));
        };
        validate_image_id(id).map_err(|_| {
            RegistryError::InvalidMetadata(format!("invalid image id in descriptor: {id}"))
        })?;
        ids.push(id.to_string());
    }

    Ok(ids)
}

/// Repository records backed by registry storage.
///
/// Mutations of one repository are serialized, so concurrent tag pushes do
/// not race and finalize sees a consistent set of tags.
#[derive(Debug, Clone)]
pub struct Repositories {
    storage: RegistryStorage,
    locks: KeyedLocks<RepositoryName>,
    images: Images,
}

impl Repositories {
    /// Create the repository store. `images` is consulted by finalize.
    pub fn new(storage: RegistryStorage, images: Images) -> Self {
        Self {
            storage,
            locks: KeyedLocks::default(),
            images,
        }
    }

    /// Look up a repository record.
    pub async fn lookup(&self, name: &RepositoryName) -> RegistryResult<Option<RepositoryRecord>> {
        self.storage
            .read_record(&RegistryStorage::repository_record_path(name))
            .await
    }

    /// Get a repository record, failing if the repository is unknown.
    pub async fn record(&self, name: &RepositoryName) -> RegistryResult<RepositoryRecord> {
        self.lookup(name)
            .await?
            .ok_or_else(|| RegistryError::RepositoryNotFound(name.to_string()))
    }

    async fn save(&self, name: &RepositoryName, record: &RepositoryRecord) -> RegistryResult<()> {
        self.storage
            .write_record(&RegistryStorage::repository_record_path(name), record)
            .await
    }

    /// Create a repository, or replace the descriptor of an existing one.
    ///
    /// Image ids listed in the descriptor are added to the repository's
    /// image list. Tags and the completion flag are kept.
    #[tracing::instrument(skip(self, descriptor), fields(repository = %name))]
    pub async fn create_or_update(
        &self,
        name: &RepositoryName,
        descriptor: &[u8],
    ) -> RegistryResult<RepositoryRecord> {
        let descriptor: serde_json::Value = serde_json::from_slice(descriptor).map_err(|err| {
            RegistryError::InvalidMetadata(format!("repository descriptor is not JSON: {err}"))
        })?;
        let ids = descriptor_image_ids(&descriptor)?;

        let _guard = self.locks.lock(name.clone()).await;
        let now = Utc::now();
        let mut record = match self.lookup(name).await? {
            Some(mut record) => {
                record.descriptor = descriptor;
                record.updated = now;
                record
            }
            None => {
                tracing::debug!("creating repository");
                RepositoryRecord {
                    namespace: name.namespace().to_string(),
                    name: name.name().to_string(),
                    descriptor,
                    images: Vec::new(),
                    upload_completed: false,
                    created: now,
                    updated: now,
                }
            }
        };

        for id in &ids {
            record.add_image(id);
        }

        self.save(name, &record).await?;
        Ok(record)
    }

    /// Point `tag` at `image_id`, and add the image to the repository.
    ///
    /// The image does not need to be fully uploaded yet; that is checked by
    /// [`Repositories::finalize`].
    #[tracing::instrument(skip(self), fields(repository = %name))]
    pub async fn put_tag(
        &self,
        name: &RepositoryName,
        tag: &str,
        image_id: &str,
    ) -> RegistryResult<()> {
        let _guard = self.locks.lock(name.clone()).await;
        let mut record = self.record(name).await?;

        let tag_record = TagRecord {
            image_id: image_id.to_string(),
            updated: Utc::now(),
        };
        self.storage
            .write_record(&RegistryStorage::tag_path(name, tag), &tag_record)
            .await?;

        if record.add_image(image_id) {
            record.updated = tag_record.updated;
            self.save(name, &record).await?;
        }

        tracing::debug!("tag updated");
        Ok(())
    }

    /// Mark the repository as uploaded, once every tagged image and each of
    /// its ancestors is checksummed.
    ///
    /// Tags are checked in name order. The first image which is missing or
    /// not checksummed is named in [`RegistryError::IncompleteUpload`].
    #[tracing::instrument(skip(self), fields(repository = %name))]
    pub async fn finalize(&self, name: &RepositoryName) -> RegistryResult<RepositoryRecord> {
        let _guard = self.locks.lock(name.clone()).await;
        let mut record = self.record(name).await?;

        let incomplete = |image: &str| RegistryError::IncompleteUpload {
            repository: name.to_string(),
            image: image.to_string(),
        };

        for (tag, image_id) in self.read_tags(name).await? {
            let Some(image) = self.images.lookup(&image_id).await? else {
                tracing::debug!(%tag, image = %image_id, "tagged image is missing");
                return Err(incomplete(&image_id));
            };
            if !image.is_checksummed() {
                tracing::debug!(%tag, image = %image_id, "tagged image is not checksummed");
                return Err(incomplete(&image_id));
            }

            for ancestor in image.ancestry().unwrap_or_default().iter().skip(1) {
                let complete = self
                    .images
                    .lookup(ancestor)
                    .await?
                    .is_some_and(|ancestor| ancestor.is_checksummed());
                if !complete {
                    tracing::debug!(%tag, image = %ancestor, "ancestor is not checksummed");
                    return Err(incomplete(ancestor));
                }
            }
        }

        if !record.upload_completed {
            record.upload_completed = true;
            record.updated = Utc::now();
            self.save(name, &record).await?;
            tracing::debug!("repository upload completed");
        }

        Ok(record)
    }

    async fn read_tags(&self, name: &RepositoryName) -> RegistryResult<BTreeMap<String, String>> {
        let mut tags = BTreeMap::new();
        for path in self
            .storage
            .list(&RegistryStorage::tags_prefix(name))
            .await?
        {
            let path = Utf8Path::new(&path);
            let Some(tag) = path.file_name() else {
                continue;
            };
            if let Some(record) = self.storage.read_record::<TagRecord>(path).await? {
                tags.insert(tag.to_string(), record.image_id);
            }
        }
        Ok(tags)
    }

    /// The tag to image id mapping of a repository.
    pub async fn get_tags(&self, name: &RepositoryName) -> RegistryResult<BTreeMap<String, String>> {
        self.record(name).await?;
        self.read_tags(name).await
    }

    /// The image id a single tag points at.
    pub async fn get_tag(&self, name: &RepositoryName, tag: &str) -> RegistryResult<String> {
        self.record(name).await?;
        self.storage
            .read_record::<TagRecord>(&RegistryStorage::tag_path(name, tag))
            .await?
            .map(|record| record.image_id)
            .ok_or_else(|| RegistryError::TagNotFound {
                repository: name.to_string(),
                tag: tag.to_string(),
            })
    }

    /// Ids of every image pushed to a repository.
    pub async fn get_images(&self, name: &RepositoryName) -> RegistryResult<Vec<String>> {
        Ok(self.record(name).await?.images)
    }
}
