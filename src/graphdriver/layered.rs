//! Upper-directory layer storage.
//!
//! Each layer keeps only what it changed over its parent, in the style of a
//! union filesystem branch:
//!
//! ```text
//! <home>/layers/<id>/
//! ├── diff/      files written in this layer, plus `.wh.<name>` markers
//! ├── parent     parent layer ID (absent for a base layer)
//! └── merged/    full view, present only while mounted
//! ```
//!
//! `get` builds `merged/` on the first reference by overlaying every
//! `diff/` from the base layer up. The last `put` compares `merged/` with
//! the parent view, rewrites `diff/` with the result and drops `merged/`.
//! Changes and diffs are read straight from `diff/`.

use super::{
    ActiveMounts, GraphDriver, LayerArchive, MountGuard, ProtoDriver, ScratchDir, parse_options,
};
use crate::archive::{
    self, Change, ChangeKind, WHITEOUT_OPAQUE, WHITEOUT_PREFIX, Whiteouts, remove_any,
};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Names reserved for backend metadata; never part of a layer's content.
const META_PREFIX: &str = ".wh..wh.";

/// Backend constructor for the [`super::DriverRegistry`].
pub fn init(home: &Path, options: &[String]) -> Result<Arc<dyn GraphDriver>> {
    if let Some(key) = parse_options("layered", options)?.keys().next() {
        return Err(Error::InvalidConfig(format!(
            "layered: unknown option {}",
            key
        )));
    }
    Ok(Arc::new(LayeredDriver::new(home)?))
}

/// Layer storage with per-layer upper directories.
#[derive(Debug)]
pub struct LayeredDriver {
    home: PathBuf,
    active: ActiveMounts,
}

impl LayeredDriver {
    pub fn new(home: &Path) -> Result<Self> {
        fs::create_dir_all(home.join("layers"))?;
        Ok(Self {
            home: home.to_path_buf(),
            active: ActiveMounts::new(),
        })
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.join("layers").join(id)
    }

    fn diff_dir(&self, id: &str) -> PathBuf {
        self.layer_dir(id).join("diff")
    }

    fn parent_of(&self, id: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.layer_dir(id).join("parent")) {
            Ok(parent) if parent.trim().is_empty() => Ok(None),
            Ok(parent) => Ok(Some(parent.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Layer IDs from the base up to and including `id`.
    fn lineage(&self, id: &str) -> Result<Vec<String>> {
        let mut chain = vec![id.to_string()];
        let mut current = id.to_string();
        while let Some(parent) = self.parent_of(&current)? {
            if chain.contains(&parent) {
                return Err(Error::Internal(format!("layer {} has a parent cycle", id)));
            }
            if !self.exists(&parent) {
                return Err(Error::LayerNotFound(parent));
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Writes the full view of `chain` (base first) into `dest`.
    fn materialize(&self, chain: &[String], dest: &Path) -> Result<()> {
        for layer in chain {
            overlay(&self.diff_dir(layer), dest)?;
        }
        Ok(())
    }

    /// Rewrites `diff/` of `id` from the mounted view at `merged`.
    fn commit(&self, id: &str, merged: &Path) -> Result<()> {
        let layer_dir = self.layer_dir(id);
        let lower = ScratchDir::new(&layer_dir, "lower")?;
        if let Some(parent) = self.parent_of(id)? {
            self.materialize(&self.lineage(&parent)?, lower.path())?;
        }

        let changes = archive::changes_dirs(merged, Some(lower.path()))?;
        let upper = ScratchDir::new(&layer_dir, "upper")?;
        write_upper(merged, upper.path(), &changes)?;

        let diff = self.diff_dir(id);
        let retired = layer_dir.join(format!(".retired-{}", uuid::Uuid::now_v7()));
        fs::rename(&diff, &retired)?;
        if let Err(e) = fs::rename(upper.path(), &diff) {
            fs::rename(&retired, &diff)?;
            return Err(e.into());
        }
        remove_any(&retired)?;

        debug!("committed {} change(s) to layer {}", changes.len(), id);
        Ok(())
    }

    /// Flushes pending writes of a mounted layer into `diff/`.
    fn sync(&self, id: &str) -> Result<()> {
        self.active.with_mounted(id, |merged| match merged {
            Some(path) => self.commit(id, path),
            None => Ok(()),
        })
    }

    /// Looks `rel` up in the lower layers (nearest first).
    fn lower_metadata(&self, lower: &[String], rel: &Path) -> Option<fs::Metadata> {
        for layer in lower {
            let diff = self.diff_dir(layer);
            // Ancestors first, so a symlinked ancestor is never followed.
            if hides(&diff, rel) {
                return None;
            }
            if let Ok(meta) = fs::symlink_metadata(diff.join(rel)) {
                return Some(meta);
            }
        }
        None
    }

    /// Native change list: valid only against the recorded parent.
    fn native_changes(&self, id: &str) -> Result<Vec<Change>> {
        let mut lower = self.lineage(id)?;
        lower.pop();
        lower.reverse();

        let diff = self.diff_dir(id);
        let mut changes = Vec::new();
        let mut deleted = BTreeSet::new();

        archive::walk(&diff, Path::new(""), &mut |rel, meta| {
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.starts_with(META_PREFIX) {
                return;
            }
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                let path = rel.with_file_name(target);
                deleted.insert(path);
                return;
            }
            let kind = match self.lower_metadata(&lower, rel) {
                None => Some(ChangeKind::Added),
                Some(old) if old.is_dir() && meta.is_dir() => {
                    archive::metadata_differs(meta, &old).then_some(ChangeKind::Modified)
                }
                Some(_) => Some(ChangeKind::Modified),
            };
            if let Some(kind) = kind {
                changes.push(Change::new(format!("/{}", rel.to_string_lossy()), kind));
            }
        })?;

        for path in deleted {
            changes.push(Change::new(
                format!("/{}", path.to_string_lossy()),
                ChangeKind::Deleted,
            ));
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn is_recorded_parent(&self, id: &str, parent: &str) -> Result<bool> {
        Ok(self.parent_of(id)?.as_deref().unwrap_or("") == parent)
    }

    /// Mount-and-walk comparison for an arbitrary parent.
    fn naive_changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        let layer = MountGuard::new(self, id)?;
        if parent.is_empty() {
            return archive::changes_dirs(layer.path(), None);
        }
        let lower = MountGuard::new(self, parent)?;
        archive::changes_dirs(layer.path(), Some(lower.path()))
    }
}

/// Returns true if `diff` whites out `rel` or one of its ancestors.
fn hides(diff: &Path, rel: &Path) -> bool {
    let mut current = PathBuf::new();
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        let marker = diff
            .join(&current)
            .join(format!("{}{}", WHITEOUT_PREFIX, name));
        if marker.exists() || diff.join(&current).join(WHITEOUT_OPAQUE).exists() {
            return true;
        }
        current.push(component);
        if current != rel
            && let Ok(meta) = fs::symlink_metadata(diff.join(&current))
            && !meta.is_dir()
        {
            return true;
        }
    }
    false
}

/// Copies an upper directory onto a view, honoring whiteouts.
fn overlay(src: &Path, dest: &Path) -> Result<()> {
    if src.join(WHITEOUT_OPAQUE).exists() {
        for child in fs::read_dir(dest)? {
            remove_any(&child?.path())?;
        }
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(META_PREFIX) {
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&dest.join(target))?;
            continue;
        }

        let from = entry.path();
        let to = dest.join(&name);
        let meta = fs::symlink_metadata(&from)?;

        if meta.is_dir() {
            let reuse = fs::symlink_metadata(&to).is_ok_and(|m| m.is_dir());
            if !reuse {
                remove_any(&to)?;
                fs::create_dir(&to)?;
            }
            overlay(&from, &to)?;
            archive::copy_dir_metadata(&to, &meta)?;
        } else {
            remove_any(&to)?;
            archive::copy_entry(&from, &to, &meta)?;
        }
    }
    Ok(())
}

/// Builds an upper directory holding `changes` taken from `merged`.
fn write_upper(merged: &Path, upper: &Path, changes: &[Change]) -> Result<()> {
    let mut dirs = Vec::new();

    for change in changes {
        let rel = change.relative_path();
        if let Some(parent) = rel.parent() {
            ensure_dirs(merged, upper, parent, &mut dirs)?;
        }

        match change.kind {
            ChangeKind::Deleted => {
                let name = rel.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                let marker = upper
                    .join(rel.parent().unwrap_or(Path::new("")))
                    .join(format!("{}{}", WHITEOUT_PREFIX, name));
                fs::write(marker, b"")?;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                let from = merged.join(rel);
                let meta = fs::symlink_metadata(&from)?;
                if meta.is_dir() {
                    ensure_dirs(merged, upper, rel, &mut dirs)?;
                } else {
                    archive::copy_entry(&from, &upper.join(rel), &meta)?;
                }
            }
        }
    }

    for (path, meta) in dirs.iter().rev() {
        archive::copy_dir_metadata(path, meta)?;
    }
    Ok(())
}

/// Creates `rel` and its ancestors inside `upper`, remembering their metadata.
fn ensure_dirs(
    merged: &Path,
    upper: &Path,
    rel: &Path,
    dirs: &mut Vec<(PathBuf, fs::Metadata)>,
) -> Result<()> {
    let mut current = PathBuf::new();
    for component in rel.components() {
        current.push(component);
        let target = upper.join(&current);
        if target.exists() {
            continue;
        }
        fs::create_dir(&target)?;
        dirs.push((target, fs::symlink_metadata(merged.join(&current))?));
    }
    Ok(())
}

impl ProtoDriver for LayeredDriver {
    fn name(&self) -> &str {
        "layered"
    }

    fn status(&self) -> Vec<(String, String)> {
        let layers = fs::read_dir(self.home.join("layers"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        vec![
            ("Root Dir".to_string(), self.home.display().to_string()),
            ("Layers".to_string(), layers.to_string()),
            ("Active Layers".to_string(), self.active.len().to_string()),
        ]
    }

    fn exists(&self, id: &str) -> bool {
        self.diff_dir(id).is_dir()
    }

    fn create(&self, id: &str, parent: &str) -> Result<()> {
        let dir = self.layer_dir(id);
        fs::create_dir(&dir)?;

        let result = (|| {
            if !parent.is_empty() {
                if !self.exists(parent) {
                    return Err(Error::LayerNotFound(parent.to_string()));
                }
                fs::write(dir.join("parent"), parent)?;
            }
            fs::create_dir(dir.join("diff"))?;
            Ok(())
        })();

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!("failed to clean up layer {}: {}", id, cleanup);
            }
            return Err(e);
        }
        debug!("created layered layer {} (parent: {:?})", id, parent);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.active.force_release(id, |merged| Ok(remove_any(merged)?))?;
        let dir = self.layer_dir(id);
        if !dir.exists() {
            return Err(Error::LayerNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn get(&self, id: &str, _mount_label: &str) -> Result<PathBuf> {
        self.active.acquire(id, || {
            if !self.exists(id) {
                return Err(Error::LayerNotFound(id.to_string()));
            }
            let merged = self.layer_dir(id).join("merged");
            // Left behind by a crash; rebuilt from committed state.
            remove_any(&merged)?;
            fs::create_dir(&merged)?;
            if let Err(e) = self.lineage(id).and_then(|chain| self.materialize(&chain, &merged)) {
                if let Err(cleanup) = remove_any(&merged) {
                    warn!("failed to clean up view of {}: {}", id, cleanup);
                }
                return Err(Error::MountFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(merged)
        })
    }

    fn put(&self, id: &str) -> Result<()> {
        self.active.release(id, |merged| {
            self.commit(id, merged)?;
            Ok(remove_any(merged)?)
        })
    }

    fn cleanup(&self) -> Result<()> {
        self.active.drain(|id, merged| {
            self.commit(id, merged)?;
            Ok(remove_any(merged)?)
        })
    }
}

impl GraphDriver for LayeredDriver {
    fn diff(&self, id: &str, parent: &str) -> Result<LayerArchive> {
        if !self.is_recorded_parent(id, parent)? {
            let changes = self.naive_changes(id, parent)?;
            let layer = MountGuard::new(self, id)?;
            let data = archive::export_changes(layer.path(), &changes)?;
            return Ok(Box::new(Cursor::new(data)));
        }

        self.sync(id)?;
        let diff = self.diff_dir(id);
        let mut changes = archive::changes_dirs(&diff, None)?;
        changes.retain(|c| {
            let name = c
                .relative_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name == WHITEOUT_OPAQUE || !name.starts_with(META_PREFIX)
        });
        let data = archive::export_changes(&diff, &changes)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>> {
        if !self.is_recorded_parent(id, parent)? {
            return self.naive_changes(id, parent);
        }
        self.sync(id)?;
        self.native_changes(id)
    }

    fn apply_diff(&self, id: &str, _parent: &str, diff: LayerArchive) -> Result<u64> {
        if !self.exists(id) {
            return Err(Error::LayerNotFound(id.to_string()));
        }
        // A mounted layer takes the diff in its view; the last put commits it.
        let mounted = self.active.with_mounted(id, |merged| Ok(merged.map(Path::to_path_buf)))?;
        match mounted {
            Some(merged) => archive::apply_layer(&merged, diff),
            None => archive::unpack_layer(&self.diff_dir(id), diff, Whiteouts::Preserve),
        }
    }

    fn diff_size(&self, id: &str, parent: &str) -> Result<u64> {
        let changes = self.changes(id, parent)?;
        if self.is_recorded_parent(id, parent)? {
            return Ok(archive::changes_size(&self.diff_dir(id), &changes));
        }
        let layer = MountGuard::new(self, id)?;
        Ok(archive::changes_size(layer.path(), &changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_land_in_upper_on_put() {
        let temp = TempDir::new().unwrap();
        let driver = LayeredDriver::new(temp.path()).unwrap();
        driver.create("base", "").unwrap();

        let view = driver.get("base", "").unwrap();
        fs::write(view.join("a"), b"1").unwrap();
        driver.put("base").unwrap();

        assert!(!view.exists());
        assert_eq!(fs::read(driver.diff_dir("base").join("a")).unwrap(), b"1");
    }

    #[test]
    fn test_delete_in_child_becomes_whiteout() {
        let temp = TempDir::new().unwrap();
        let driver = LayeredDriver::new(temp.path()).unwrap();
        driver.create("base", "").unwrap();
        let view = driver.get("base", "").unwrap();
        fs::write(view.join("a"), b"1").unwrap();
        driver.put("base").unwrap();

        driver.create("child", "base").unwrap();
        let view = driver.get("child", "").unwrap();
        fs::remove_file(view.join("a")).unwrap();
        driver.put("child").unwrap();

        assert!(driver.diff_dir("child").join(".wh.a").exists());
        let changes = driver.changes("child", "base").unwrap();
        assert_eq!(changes, vec![Change::new("/a", ChangeKind::Deleted)]);

        let view = driver.get("child", "").unwrap();
        assert!(!view.join("a").exists());
        driver.put("child").unwrap();
    }

    #[test]
    fn test_hides_checks_ancestors() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".wh.etc"), b"").unwrap();
        assert!(hides(temp.path(), Path::new("etc/passwd")));
        assert!(!hides(temp.path(), Path::new("usr/bin")));
    }
}
