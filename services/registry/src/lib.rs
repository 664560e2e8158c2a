//! # Image Registry
//!
//! This crate implements the storage engine behind the legacy (v1) image
//! push/pull protocol, and an HTTP surface for it.
//!
//! A push is a sequence of independent requests driven by the client: for
//! each image, its metadata JSON, then its layer, then the layer checksum;
//! then one request per tag; and finally a request which finalizes the
//! repository. The server keeps no session between these requests. Each
//! image and repository record carries its own progress, and every step can
//! be retried.
//!
//! ## Features
//!
//! - Per-image state machine: registered, layer stored, checksummed
//! - Streaming checksum verification (`sha256`, `sha512`)
//! - Bounded ancestry construction with cycle detection
//! - Repository tags and a finalize step which checks every tagged image
//! - Pluggable storage backend via the `storage` crate
//! - Pluggable access gate and audit sink
//!
//! ## Example
//!
//! ```no_run
//! use image_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let registry = RegistryBuilder::new(storage.into())
//!     .bucket("registry")
//!     .build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

pub mod access;
mod ancestry;
mod api;
pub mod audit;
mod checksum;
mod config;
mod error;
mod image;
mod locks;
mod metadata;
mod name;
mod repository;
mod service;
mod storage;

pub use ancestry::{AncestryBuilder, DEFAULT_MAX_DEPTH, ParentIndex};
pub use api::{REGISTRY_VERSION, RegistryBuilder};
pub use checksum::{Algorithm, Checksum, Hasher, validate};
pub use config::{Config, LogFormat};
pub use error::{RegistryError, RegistryResult};
pub use image::{ImageRecord, ImageState, Images, LayerInfo};
pub use metadata::ImageMetadata;
pub use name::{RepositoryName, validate_image_id, validate_tag};
pub use repository::{Repositories, RepositoryRecord};
pub use service::{ImageJson, Registry, RequestContext, parse_tag_body};
pub use storage::RegistryStorage;
