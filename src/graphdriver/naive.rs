//! Diffing for backends that only know how to mount layers.
//!
//! [`NaiveDiffDriver`] mounts the layer and its parent and compares the two
//! trees file by file. Slow on big layers, but it works for any backend.

use super::{GraphDriver, LayerArchive, MountGuard, ProtoDriver};
use crate::archive::{self, Change};
use crate::error::Result;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// Adds directory-walking diff operations to a [`ProtoDriver`].
pub struct NaiveDiffDriver<D> {
    inner: D,
}

impl<D: ProtoDriver> NaiveDiffDriver<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ProtoDriver> ProtoDriver for NaiveDiffDriver<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn status(&self) -> Vec<(String, String)> {
        self.inner.status()
    }

    fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    fn create(&self, id: &str, parent: &str) -> Result<()> {
        self.inner.create(id, parent)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.inner.remove(id)
    }

    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        self.inner.get(id, mount_label)
    }

    fn put(&self, id: &str) -> Result<()> {
        self.inner.put(id)
    }

    fn cleanup(&self) -> Result<()> {
        self.inner.cleanup()
    }
}

impl<D: ProtoDriver> GraphDriver for NaiveDiffDriver<D> {
    fn diff(&self, id: &str, parent: &str) -> Result<LayerArchive> {
        let layer = MountGuard::new(&self.inner, id)?;
        let changes = self.changes(id, parent)?;
        let data = archive::export_changes(layer.path(), &changes)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        let layer = MountGuard::new(&self.inner, id)?;
        if parent.is_empty() {
            return archive::changes_dirs(layer.path(), None);
        }
        let lower = MountGuard::new(&self.inner, parent)?;
        archive::changes_dirs(layer.path(), Some(lower.path()))
    }

    fn apply_diff(&self, id: &str, _parent: &str, diff: LayerArchive) -> Result<u64> {
        let layer = MountGuard::new(&self.inner, id)?;
        let start = Instant::now();
        let size = archive::apply_layer(layer.path(), diff)?;
        debug!(
            "applied {} bytes to layer {} in {:?}",
            size,
            id,
            start.elapsed()
        );
        Ok(size)
    }

    fn diff_size(&self, id: &str, parent: &str) -> Result<u64> {
        let changes = self.changes(id, parent)?;
        let layer = MountGuard::new(&self.inner, id)?;
        Ok(archive::changes_size(layer.path(), &changes))
    }
}
