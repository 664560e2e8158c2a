//! Image records and the per-image push state machine.
//!
//! An image moves through three states, each reached by one push step:
//!
//! 1. [`ImageState::Registered`]: the metadata JSON is stored.
//! 2. [`ImageState::LayerStored`]: the layer bytes are stored.
//! 3. [`ImageState::Checksummed`]: the layer matched its declared checksum
//!    and the ancestry was materialized. Only now can the image be pulled.
//!
//! A failed step leaves the record in its last good state. Each step replaces
//! what an earlier attempt wrote, so clients recover by retrying.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ancestry::{AncestryBuilder, ParentIndex};
use crate::checksum::Checksum;
use crate::error::{RegistryError, RegistryResult};
use crate::locks::KeyedLocks;
use crate::metadata::ImageMetadata;
use crate::storage::RegistryStorage;

/// Push progress of an image, derived from which fields of its record are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    /// Metadata stored
    Registered,
    /// Layer stored, checksum not yet verified
    LayerStored,
    /// Checksum verified and ancestry computed
    Checksummed,
}

/// Reference to a stored layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Layer size in bytes
    pub size: u64,
}

/// The durable state of one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    id: String,
    parent: Option<String>,
    json_digest: Checksum,
    layer: Option<LayerInfo>,
    checksum: Option<Checksum>,
    payload_checksum: Option<Checksum>,
    ancestry: Option<Vec<String>>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl ImageRecord {
    fn registered(metadata: &ImageMetadata, created: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            id: metadata.id().to_string(),
            parent: metadata.parent().map(str::to_string),
            json_digest: Checksum::sha256(metadata.raw()),
            layer: None,
            checksum: None,
            payload_checksum: None,
            ancestry: None,
            created: created.unwrap_or(now),
            updated: now,
        }
    }

    /// Drop the layer and everything derived from it.
    fn reset_layer(&mut self) {
        self.layer = None;
        self.checksum = None;
        self.payload_checksum = None;
        self.ancestry = None;
        self.updated = Utc::now();
    }

    /// The image id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The parent image id, as declared in the metadata
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The stored layer, if uploaded
    pub fn layer(&self) -> Option<LayerInfo> {
        self.layer
    }

    /// The verified layer checksum
    pub fn checksum(&self) -> Option<&Checksum> {
        self.checksum.as_ref()
    }

    /// The payload checksum submitted alongside the layer checksum
    pub fn payload_checksum(&self) -> Option<&Checksum> {
        self.payload_checksum.as_ref()
    }

    /// The materialized ancestry, self first
    pub fn ancestry(&self) -> Option<&[String]> {
        self.ancestry.as_deref()
    }

    /// When the image was first registered
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When the record last changed
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Current push state
    pub fn state(&self) -> ImageState {
        match (&self.layer, &self.checksum, &self.ancestry) {
            (Some(_), Some(_), Some(_)) => ImageState::Checksummed,
            (Some(_), _, _) => ImageState::LayerStored,
            _ => ImageState::Registered,
        }
    }

    /// Whether the layer has been uploaded
    pub fn is_uploaded(&self) -> bool {
        self.layer.is_some()
    }

    /// Whether the image is ready to be pulled
    pub fn is_checksummed(&self) -> bool {
        self.state() == ImageState::Checksummed
    }
}

/// Image records backed by registry storage.
///
/// Mutations of one image id are serialized. Reads take no locks: every
/// object is replaced whole, so a reader sees either the old or new version.
#[derive(Debug, Clone)]
pub struct Images {
    storage: RegistryStorage,
    locks: KeyedLocks<String>,
    ancestry: AncestryBuilder,
}

impl Images {
    /// Create the image store.
    pub fn new(storage: RegistryStorage, ancestry: AncestryBuilder) -> Self {
        Self {
            storage,
            locks: KeyedLocks::default(),
            ancestry,
        }
    }

    /// Look up an image record.
    pub async fn lookup(&self, id: &str) -> RegistryResult<Option<ImageRecord>> {
        self.storage
            .read_record(&RegistryStorage::image_record_path(id))
            .await
    }

    /// Get an image record, failing if the image is unknown.
    pub async fn record(&self, id: &str) -> RegistryResult<ImageRecord> {
        self.lookup(id)
            .await?
            .ok_or_else(|| RegistryError::ImageNotFound(id.to_string()))
    }

    async fn save(&self, record: &ImageRecord) -> RegistryResult<()> {
        self.storage
            .write_record(&RegistryStorage::image_record_path(&record.id), record)
            .await
    }

    /// Store image metadata.
    ///
    /// Identical metadata is a no-op. Different metadata replaces the old and
    /// returns the image to [`ImageState::Registered`], since the layer was
    /// pushed against other metadata.
    #[tracing::instrument(skip_all, fields(image = %metadata.id()))]
    pub async fn put_json(&self, metadata: ImageMetadata) -> RegistryResult<ImageRecord> {
        let _guard = self.locks.lock(metadata.id().to_string()).await;
        let json_path = RegistryStorage::image_json_path(metadata.id());

        let existing = self.lookup(metadata.id()).await?;
        if let Some(record) = &existing {
            if record.json_digest == Checksum::sha256(metadata.raw())
                && self.storage.read(&json_path).await?.as_ref() == Some(metadata.raw())
            {
                tracing::debug!("metadata unchanged");
                return Ok(record.clone());
            }
        }

        // The reset record goes first, so an interrupted write never leaves a
        // pullable image next to replaced metadata.
        let record = ImageRecord::registered(&metadata, existing.map(|r| r.created));
        self.save(&record).await?;
        self.storage.write(&json_path, metadata.raw()).await?;

        tracing::debug!(parent = ?record.parent, "image registered");
        Ok(record)
    }

    /// Store the layer of a registered image, replacing any earlier upload.
    ///
    /// Re-sending the layer of a checksummed image is a no-op if the bytes
    /// still match the verified checksum.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn put_layer(&self, id: &str, data: Bytes) -> RegistryResult<ImageRecord> {
        let _guard = self.locks.lock(id.to_string()).await;
        let mut record = self.record(id).await?;

        if record.is_checksummed() && record.checksum.as_ref().is_some_and(|c| c.matches(&data)) {
            tracing::debug!("layer unchanged");
            return Ok(record);
        }

        // Demote before touching the blob, so a checksummed record never
        // points at a partly replaced layer.
        if record.layer.is_some() {
            record.reset_layer();
            self.save(&record).await?;
        }

        self.storage
            .write(&RegistryStorage::layer_path(id), &data)
            .await?;

        record.reset_layer();
        record.layer = Some(LayerInfo {
            size: data.len() as u64,
        });
        self.save(&record).await?;

        tracing::debug!("layer stored");
        Ok(record)
    }

    /// Verify the stored layer against `checksum` and, on a match, compute
    /// the ancestry and mark the image checksummed.
    ///
    /// A mismatch leaves the record as it was.
    #[tracing::instrument(skip(self, checksum, payload), fields(checksum = %checksum))]
    pub async fn put_checksum(
        &self,
        id: &str,
        checksum: Checksum,
        payload: Option<Checksum>,
    ) -> RegistryResult<ImageRecord> {
        let _guard = self.locks.lock(id.to_string()).await;
        let mut record = self.record(id).await?;

        if record.layer.is_none() {
            return Err(RegistryError::NotReady {
                image: id.to_string(),
                missing: "layer",
            });
        }

        if record.is_checksummed() && record.checksum.as_ref() == Some(&checksum) {
            tracing::debug!("checksum already verified");
            if record.payload_checksum != payload {
                record.payload_checksum = payload;
                record.updated = Utc::now();
                self.save(&record).await?;
            }
            return Ok(record);
        }

        let actual = self
            .storage
            .checksum(&RegistryStorage::layer_path(id), checksum.algorithm())
            .await?
            .ok_or_else(|| RegistryError::NotReady {
                image: id.to_string(),
                missing: "layer",
            })?;

        if actual != checksum {
            tracing::warn!(%actual, "layer checksum mismatch");
            return Err(RegistryError::ChecksumMismatch {
                image: id.to_string(),
                expected: checksum.to_string(),
                actual: actual.to_string(),
            });
        }

        let ancestry = self
            .ancestry
            .build(id, record.parent.as_deref(), self)
            .await?;

        record.checksum = Some(checksum);
        record.payload_checksum = payload;
        record.ancestry = Some(ancestry);
        record.updated = Utc::now();
        self.save(&record).await?;

        tracing::debug!("image checksummed");
        Ok(record)
    }

    /// The metadata JSON of an image, exactly as submitted.
    pub async fn get_json(&self, id: &str) -> RegistryResult<Bytes> {
        self.record(id).await?;
        self.storage
            .read(&RegistryStorage::image_json_path(id))
            .await?
            .ok_or_else(|| RegistryError::NotReady {
                image: id.to_string(),
                missing: "json",
            })
    }

    /// The layer bytes of an image.
    pub async fn get_layer(&self, id: &str) -> RegistryResult<Bytes> {
        let record = self.record(id).await?;
        let not_ready = || RegistryError::NotReady {
            image: id.to_string(),
            missing: "layer",
        };

        if record.layer.is_none() {
            return Err(not_ready());
        }

        self.storage
            .read(&RegistryStorage::layer_path(id))
            .await?
            .ok_or_else(not_ready)
    }

    /// The ancestry of a checksummed image, self first.
    pub async fn get_ancestry(&self, id: &str) -> RegistryResult<Vec<String>> {
        self.record(id)
            .await?
            .ancestry
            .ok_or_else(|| RegistryError::NotReady {
                image: id.to_string(),
                missing: "checksum",
            })
    }
}

#[async_trait::async_trait]
impl ParentIndex for Images {
    async fn parent_of(&self, id: &str) -> RegistryResult<Option<String>> {
        Ok(self.record(id).await?.parent)
    }
}
