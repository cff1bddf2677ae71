//! File-backed configuration for a page grid instance.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::pager::PageMemoryOptions;
use crate::storage::btree::BTreeOptions;
use crate::storage::reuse::ReuseOptions;
use crate::types::GridError;

/// Aggregate options for page memory, the reuse list and the B+ tree.
///
/// Every section is optional in TOML and falls back to its defaults:
///
/// ```toml
/// store_dir = "/var/lib/pagegrid"
///
/// [pager]
/// page_size = 4096
/// segments = 8
///
/// [btree]
/// max_items = 64
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Directory for page files; pages stay in process memory when unset.
    pub store_dir: Option<PathBuf>,
    /// Page memory options.
    pub pager: PageMemoryOptions,
    /// Reuse list options.
    pub reuse: ReuseOptions,
    /// B+ tree options.
    pub btree: BTreeOptions,
}

impl GridConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: GridConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GridConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Checks every section, including that tree nodes fit the page size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pager.validate()?;
        self.reuse.validate()?;
        self.btree.validate(self.pager.page_size as usize)?;
        Ok(())
    }
}

/// Errors raised while loading a [`GridConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not valid TOML for [`GridConfig`].
    #[error("failed to parse config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File path, when parsed from a file.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(#[from] GridError),
}
