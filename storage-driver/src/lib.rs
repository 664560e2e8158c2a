//! The blob-filesystem abstraction shared by the storage backends.
//!
//! A [`Driver`] stores opaque byte objects under a `(bucket, path)` key and
//! supports the handful of operations a content store needs: stat, write,
//! read, delete and prefix listing.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
