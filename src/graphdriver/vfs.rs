//! Full-copy layer storage.
//!
//! Each layer is a plain directory under `<home>/dir/<id>`. Creating a
//! child copies the whole parent tree, so there is nothing to mount: `get`
//! only counts references and returns the directory.

use super::{ActiveMounts, GraphDriver, NaiveDiffDriver, ProtoDriver, parse_options};
use crate::archive;
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backend constructor for the [`super::DriverRegistry`].
pub fn init(home: &Path, options: &[String]) -> Result<Arc<dyn GraphDriver>> {
    if let Some(key) = parse_options("vfs", options)?.keys().next() {
        return Err(Error::InvalidConfig(format!("vfs: unknown option {}", key)));
    }
    Ok(Arc::new(NaiveDiffDriver::new(VfsDriver::new(home)?)))
}

/// Copy-based layer storage.
#[derive(Debug)]
pub struct VfsDriver {
    home: PathBuf,
    active: ActiveMounts,
}

impl VfsDriver {
    pub fn new(home: &Path) -> Result<Self> {
        fs::create_dir_all(home.join("dir"))?;
        Ok(Self {
            home: home.to_path_buf(),
            active: ActiveMounts::new(),
        })
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.home.join("dir").join(id)
    }

    fn populate(&self, dir: &Path, parent: &str) -> Result<()> {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
        if parent.is_empty() {
            return Ok(());
        }
        let parent_dir = self.get(parent, "")?;
        let copied = archive::copy_dir(&parent_dir, dir);
        self.put(parent)?;
        copied?;
        if let Ok(meta) = fs::symlink_metadata(&parent_dir) {
            archive::copy_dir_metadata(dir, &meta)?;
        }
        Ok(())
    }
}

impl ProtoDriver for VfsDriver {
    fn name(&self) -> &str {
        "vfs"
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![
            ("Root Dir".to_string(), self.home.display().to_string()),
            ("Active Layers".to_string(), self.active.len().to_string()),
        ]
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).is_dir()
    }

    fn create(&self, id: &str, parent: &str) -> Result<()> {
        let dir = self.dir(id);
        fs::create_dir(&dir)?;

        if let Err(e) = self.populate(&dir, parent) {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!("failed to clean up layer {}: {}", id, cleanup);
            }
            return Err(e);
        }
        debug!("created vfs layer {} (parent: {:?})", id, parent);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.active.force_release(id, |_| Ok(()))?;
        let dir = self.dir(id);
        if !dir.exists() {
            return Err(Error::LayerNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn get(&self, id: &str, _mount_label: &str) -> Result<PathBuf> {
        let dir = self.dir(id);
        self.active.acquire(id, || {
            if !dir.is_dir() {
                return Err(Error::LayerNotFound(id.to_string()));
            }
            Ok(dir.clone())
        })
    }

    fn put(&self, id: &str) -> Result<()> {
        self.active.release(id, |_| Ok(()))
    }

    fn cleanup(&self) -> Result<()> {
        self.active.drain(|_, _| Ok(()))
    }
}
