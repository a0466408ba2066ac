//! # Image Metadata
//!
//! An image is an immutable layer plus the metadata needed to run it and to
//! find it again as a build cache hit. Each image owns one directory in the
//! graph:
//!
//! ```text
//! <root>/graph/<id>/
//! ├── json        Image record (serde_json)
//! └── layersize   bytes the layer adds over its parent, once known
//! ```
//!
//! Layer content itself lives in the graph driver under the same ID.

use crate::constants::{IMAGE_JSON_FILE, IMAGE_SIZE_FILE, validate_id};
use crate::error::{Error, Result};
use crate::fsutil::write_atomic;
use crate::runconfig::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Image record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// Parent image ID, empty for a base image.
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub comment: String,
    pub created: DateTime<Utc>,
    /// Container this image was committed from.
    #[serde(default)]
    pub container: String,
    /// Configuration of that container, used for cache matching.
    #[serde(default)]
    pub container_config: RunConfig,
    /// Defaults for containers created from this image.
    #[serde(default)]
    pub config: Option<RunConfig>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    /// Layer size in bytes; not stored in `json`.
    #[serde(skip)]
    pub size: u64,
}

impl Image {
    /// Creates a record for a new image.
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: parent.into(),
            comment: String::new(),
            created: Utc::now(),
            container: String::new(),
            container_config: RunConfig::default(),
            config: None,
            author: String::new(),
            architecture: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            size: 0,
        }
    }

    /// Checks that the ID is usable as a directory name.
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id).map_err(|reason| Error::InvalidContainerId {
            id: self.id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Loads an image record from its directory.
    ///
    /// A missing or unreadable size file yields size 0; see [`Image::has_size`].
    pub fn load(dir: &Path) -> Result<Self> {
        let json_path = dir.join(IMAGE_JSON_FILE);
        let data = fs::read(&json_path)?;
        let mut img: Image =
            serde_json::from_slice(&data).map_err(|e| Error::CorruptRecord {
                path: json_path.clone(),
                reason: e.to_string(),
            })?;
        img.validate()?;

        img.size = fs::read_to_string(dir.join(IMAGE_SIZE_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        Ok(img)
    }

    /// Writes the record into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        write_atomic(&dir.join(IMAGE_JSON_FILE), &data)
    }

    /// Returns true if `dir` holds a cached layer size.
    pub fn has_size(dir: &Path) -> bool {
        dir.join(IMAGE_SIZE_FILE).is_file()
    }

    /// Writes the cached layer size into `dir`.
    pub fn save_size(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(IMAGE_SIZE_FILE), self.size.to_string().as_bytes())
    }

    /// Returns true if this image has no parent.
    pub fn is_base(&self) -> bool {
        self.parent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::generate_id;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let mut img = Image::new(generate_id(), "");
        img.comment = "base".to_string();
        img.size = 42;
        img.save(temp.path()).unwrap();
        img.save_size(temp.path()).unwrap();

        let loaded = Image::load(temp.path()).unwrap();
        assert_eq!(loaded, img);
    }

    #[test]
    fn test_load_without_size() {
        let temp = TempDir::new().unwrap();
        let img = Image::new(generate_id(), "");
        img.save(temp.path()).unwrap();
        assert!(!Image::has_size(temp.path()));
        assert_eq!(Image::load(temp.path()).unwrap().size, 0);
    }

    #[test]
    fn test_load_rejects_bad_id() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(IMAGE_JSON_FILE),
            r#"{"id":"../etc","created":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(Image::load(temp.path()).is_err());
    }
}
