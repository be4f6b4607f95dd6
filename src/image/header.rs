//! JSON metadata header embedded in every image

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current header schema; reserved for future header evolution.
pub const SCHEMA_VERSION: u32 = 1;

/// Working directory written by the builder when the configuration leaves
/// it unset.
pub const DEFAULT_WORK_DIR: &str = "/app";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHeader {
    /// Human name of the image.
    pub image_name: String,
    /// Application version string.
    pub version: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// UTC timestamp recorded when the image was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Lowercase hex SHA-256 of the uncompressed tar payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Uncompressed payload size in KiB, rounded up. Advisory.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sizeKB")]
    pub size_kb: Option<u64>,
    #[serde(default)]
    pub runtime: RuntimeSpec,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl ImageHeader {
    /// Check the fields every image must carry. Unknown fields were already
    /// dropped by serde; `hash`/`created`/`sizeKB` stay optional so that
    /// hand-written headers remain loadable.
    pub fn validate(&self) -> Result<()> {
        if self.image_name.is_empty() {
            return Err(Error::MissingField("imageName"));
        }
        if self.version.is_empty() {
            return Err(Error::MissingField("version"));
        }
        Ok(())
    }
}

/// `runtime` block: how to start the packed application. The same shape is
/// used in the build configuration and copied verbatim into the header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Absolute path inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Argv tokens; the first is the program.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment installed before exec.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}
