//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;
use storage::StorageConfig;

use crate::ancestry::DEFAULT_MAX_DEPTH;
use crate::api::RegistryBuilder;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Configuration for `registry-server`, usually read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Storage bucket for registry objects
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Storage backend
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Longest ancestry accepted when an image is checksummed
    #[serde(default = "default_max_ancestry_depth")]
    pub max_ancestry_depth: usize,

    /// Advertise the registry as standalone
    #[serde(default = "default_standalone")]
    pub standalone: bool,

    /// Value for the `X-Docker-Endpoints` header
    #[serde(default)]
    pub endpoints: Option<String>,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 5000))
}

fn default_bucket() -> String {
    "registry".to_string()
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory {
        bucket: default_bucket(),
    }
}

fn default_max_ancestry_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_standalone() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bucket: default_bucket(),
            storage: default_storage(),
            max_ancestry_depth: default_max_ancestry_depth(),
            standalone: default_standalone(),
            endpoints: None,
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    #[cfg(feature = "cli")]
    pub fn from_toml(document: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(document)
    }

    /// Read and parse a TOML file.
    #[cfg(feature = "cli")]
    pub fn load(path: &camino::Utf8Path) -> eyre::Result<Self> {
        use eyre::WrapErr;

        let document = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config file {path}"))?;
        Self::from_toml(&document).wrap_err_with(|| format!("parsing config file {path}"))
    }

    /// A registry builder configured from this file, on top of `storage`.
    pub fn registry(&self, storage: storage::Storage) -> RegistryBuilder {
        let builder = RegistryBuilder::new(storage)
            .bucket(self.bucket.clone())
            .max_ancestry_depth(self.max_ancestry_depth)
            .standalone(self.standalone);

        match &self.endpoints {
            Some(endpoints) => builder.endpoints(endpoints.clone()),
            None => builder,
        }
    }
}
