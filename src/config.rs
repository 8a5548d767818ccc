//! The `espore.json` configuration document.
//!
//! The document is looked up in the current working directory. A missing
//! file is not an error: the default configuration (output under `dist`)
//! is used instead so that `espore` works out of the box in a firmware
//! tree that follows the conventions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::utils;

/// Build-related configuration: which directories hold libraries and device
/// descriptors, and where images are emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Filesystem globs resolving to library directories.
    pub libs: Vec<String>,
    /// Filesystem globs resolving to device directories.
    pub devices: Vec<String>,
    /// Output directory for images and manifests.
    pub output: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            libs: Vec::new(),
            devices: Vec::new(),
            output: "dist".into(),
        }
    }
}

/// Top-level espore configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EsporeConfig {
    pub build: BuildConfig,
    #[serde(rename = "dataDir")]
    pub data_dir: String,
}

impl EsporeConfig {
    /// Read `espore.json` from the current directory; fall back to the
    /// default configuration when the file is missing. A present but
    /// malformed file is a real error.
    pub fn read() -> crate::Result<EsporeConfig> {
        Self::read_from(Path::new("espore.json"))
    }

    pub fn read_from(path: &Path) -> crate::Result<EsporeConfig> {
        if !path.exists() {
            log::info!(
                "Cannot find {} in the current directory. Using default configuration",
                path.display()
            );
            return Ok(EsporeConfig::default());
        }
        utils::read_json(path)
    }

    /// The directory where espore keeps its own state, such as the command
    /// history. Defaults to `~/.espore`.
    pub fn data_dir(&self) -> PathBuf {
        if !self.data_dir.is_empty() {
            return PathBuf::from(&self.data_dir);
        }
        let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
        Path::new(&home).join(".espore")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
