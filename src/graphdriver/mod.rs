//! # Graph Drivers
//!
//! Copy-on-write layer storage. A layer is identified by the ID of the image
//! or container it backs and optionally sits on a parent layer.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      GraphDriver                            │
//! │   diff │ changes │ apply_diff │ diff_size                   │
//! ├────────────────────────────────────────────────────────────┤
//! │                      ProtoDriver                            │
//! │   create │ remove │ get │ put │ exists │ status │ cleanup   │
//! └────────────────────────────────────────────────────────────┘
//!          │                                   │
//!   NaiveDiffDriver<VfsDriver>           LayeredDriver
//!   (diff by walking mounts)       (diff from the upper directory)
//! ```
//!
//! ## Mount Reference Counting
//!
//! Several operations may need the same layer at once (a running container,
//! a commit, an export). Every backend tracks mounts in an [`ActiveMounts`]
//! arena: `get` increments and mounts on 0→1, `put` decrements and unmounts
//! on 1→0. A layer is mounted iff its count is positive.
//!
//! ## Backend Selection
//!
//! Backends are constructed through a [`DriverRegistry`] populated by the
//! caller. [`DriverRegistry::with_defaults`] knows `layered` and `vfs`.

pub mod layered;
pub mod naive;
pub mod vfs;

pub use self::layered::LayeredDriver;
pub use self::naive::NaiveDiffDriver;
pub use self::vfs::VfsDriver;
pub use crate::archive::{Change, ChangeKind, LayerArchive};

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

// =============================================================================
// Driver Traits
// =============================================================================

/// Layer lifecycle operations every backend provides.
pub trait ProtoDriver: Send + Sync {
    /// Backend name, e.g. `vfs`.
    fn name(&self) -> &str;

    /// Human readable `(label, value)` pairs describing the backend.
    fn status(&self) -> Vec<(String, String)>;

    /// Returns true if storage for `id` exists.
    fn exists(&self, id: &str) -> bool;

    /// Allocates storage for a new layer.
    ///
    /// With a non-empty `parent`, the new layer shows the parent's content
    /// until written. The layer directory is created first with
    /// `create_dir`, so a second create of the same ID fails instead of
    /// racing the first.
    fn create(&self, id: &str, parent: &str) -> Result<()>;

    /// Destroys a layer's storage.
    ///
    /// A mounted layer is released with a warning before removal.
    fn remove(&self, id: &str) -> Result<()>;

    /// Mounts a layer (or takes another reference) and returns its path.
    fn get(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    /// Drops a reference taken by [`ProtoDriver::get`]; unmounts at zero.
    ///
    /// Releasing a layer that is not mounted is a no-op.
    fn put(&self, id: &str) -> Result<()>;

    /// Unmounts every active layer.
    fn cleanup(&self) -> Result<()>;
}

/// Full layer storage contract, including diffing.
pub trait GraphDriver: ProtoDriver {
    /// Archive of the content `id` introduces over `parent`.
    ///
    /// An empty `parent` exports everything.
    fn diff(&self, id: &str, parent: &str) -> Result<LayerArchive>;

    /// Paths `id` added, modified or deleted relative to `parent`.
    fn changes(&self, id: &str, parent: &str) -> Result<Vec<Change>>;

    /// Extracts a layer archive onto `id`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// [`Error::PathTraversal`] if an entry would land outside the layer.
    fn apply_diff(&self, id: &str, parent: &str, diff: LayerArchive) -> Result<u64>;

    /// Bytes `id` adds over `parent`.
    fn diff_size(&self, id: &str, parent: &str) -> Result<u64>;
}

// =============================================================================
// Active Mount Arena
// =============================================================================

#[derive(Debug)]
struct ActiveMount {
    count: usize,
    path: PathBuf,
}

/// Reference counts of mounted layers.
///
/// The lock is held across the mount and unmount callbacks, so a layer
/// is never mounted twice or unmounted while another caller mounts it.
#[derive(Debug, Default)]
pub struct ActiveMounts {
    mounts: Mutex<HashMap<String, ActiveMount>>,
}

impl ActiveMounts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveMount>>> {
        self.mounts
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Takes a reference, calling `mount` on the first one.
    pub fn acquire(&self, id: &str, mount: impl FnOnce() -> Result<PathBuf>) -> Result<PathBuf> {
        let mut mounts = self.lock()?;
        if let Some(active) = mounts.get_mut(id) {
            active.count += 1;
            return Ok(active.path.clone());
        }

        let path = mount()?;
        debug!("mounted layer {} at {}", id, path.display());
        mounts.insert(
            id.to_string(),
            ActiveMount {
                count: 1,
                path: path.clone(),
            },
        );
        Ok(path)
    }

    /// Drops a reference, calling `unmount` when the last one goes.
    ///
    /// Unknown IDs are ignored.
    pub fn release(&self, id: &str, unmount: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        let mut mounts = self.lock()?;
        let Some(active) = mounts.get_mut(id) else {
            return Ok(());
        };
        if active.count > 1 {
            active.count -= 1;
            return Ok(());
        }

        let path = active.path.clone();
        mounts.remove(id);
        unmount(&path)?;
        debug!("unmounted layer {}", id);
        Ok(())
    }

    /// Unmounts `id` regardless of its count. Returns true if it was mounted.
    pub fn force_release(&self, id: &str, unmount: impl FnOnce(&Path) -> Result<()>) -> Result<bool> {
        let mut mounts = self.lock()?;
        let Some(active) = mounts.remove(id) else {
            return Ok(false);
        };
        warn!(
            "layer {} still has {} active reference(s), releasing",
            id, active.count
        );
        unmount(&active.path)?;
        Ok(true)
    }

    /// Runs `f` with the mount path of `id` (if mounted) while holding the lock.
    pub fn with_mounted<T>(&self, id: &str, f: impl FnOnce(Option<&Path>) -> Result<T>) -> Result<T> {
        let mounts = self.lock()?;
        f(mounts.get(id).map(|a| a.path.as_path()))
    }

    /// Unmounts everything. Keeps going after a failure and reports the first.
    pub fn drain(&self, mut unmount: impl FnMut(&str, &Path) -> Result<()>) -> Result<()> {
        let mut mounts = self.lock()?;
        let mut first_err = None;
        for (id, active) in mounts.drain() {
            if let Err(e) = unmount(&id, &active.path) {
                warn!("failed to unmount layer {}: {}", id, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Current reference count of `id`.
    pub fn count(&self, id: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|m| m.get(id).map(|a| a.count))
            .unwrap_or(0)
    }

    /// Number of mounted layers.
    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Scoped Guards
// =============================================================================

/// A mounted layer, released on drop.
pub struct MountGuard<'a, D: ProtoDriver + ?Sized> {
    driver: &'a D,
    id: String,
    path: PathBuf,
}

impl<'a, D: ProtoDriver + ?Sized> MountGuard<'a, D> {
    /// Mounts `id` through `driver`.
    pub fn new(driver: &'a D, id: &str) -> Result<Self> {
        let path = driver.get(id, "")?;
        Ok(Self {
            driver,
            id: id.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<D: ProtoDriver + ?Sized> Drop for MountGuard<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.put(&self.id) {
            warn!("failed to release layer {}: {}", self.id, e);
        }
    }
}

/// A scratch directory removed on drop.
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Creates `<parent>/.<prefix>-<uuid>`.
    pub(crate) fn new(parent: &Path, prefix: &str) -> Result<Self> {
        let path = parent.join(format!(".{}-{}", prefix, uuid::Uuid::now_v7()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = crate::archive::remove_any(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Splits `key=value` driver options. Backends without options reject any.
pub(crate) fn parse_options(driver: &str, options: &[String]) -> Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();
    for option in options {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            Error::InvalidConfig(format!("{}: option '{}' is not key=value", driver, option))
        })?;
        parsed.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(parsed)
}

// =============================================================================
// Driver Registry
// =============================================================================

/// Constructor of a backend from its home directory and options.
pub type DriverInit = fn(&Path, &[String]) -> Result<Arc<dyn GraphDriver>>;

/// Registry of graph driver backends.
///
/// Registration order is priority order for automatic selection.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<(String, DriverInit)>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.drivers.push(("layered".to_string(), layered::init));
        registry.drivers.push(("vfs".to_string(), vfs::init));
        registry
    }

    /// Adds a backend.
    pub fn register(&mut self, name: &str, init: DriverInit) -> Result<()> {
        if self.drivers.iter().any(|(n, _)| n == name) {
            return Err(Error::InvalidConfig(format!(
                "graph driver '{}' registered twice",
                name
            )));
        }
        self.drivers.push((name.to_string(), init));
        Ok(())
    }

    /// Registered backend names in priority order.
    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Constructs the backend `name` with its home under `root`.
    ///
    /// An empty name picks the highest priority backend that already has
    /// state under `root`, falling back to the highest priority overall.
    pub fn new_driver(&self, name: &str, root: &Path, options: &[String]) -> Result<Arc<dyn GraphDriver>> {
        let name = if name.is_empty() {
            self.select(root)?
        } else {
            name.to_string()
        };

        let (_, init) = self
            .drivers
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| Error::DriverNotSupported(name.clone()))?;

        let home = root.join(&name);
        fs::create_dir_all(&home)?;
        let driver = init(&home, options)?;
        info!("using graph driver {}", driver.name());
        Ok(driver)
    }

    fn select(&self, root: &Path) -> Result<String> {
        for (name, _) in &self.drivers {
            let home = root.join(name);
            let has_state = fs::read_dir(&home)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if has_state {
                debug!("found prior state for graph driver {}", name);
                return Ok(name.clone());
            }
        }
        self.drivers
            .first()
            .map(|(n, _)| n.clone())
            .ok_or_else(|| Error::DriverNotSupported("no graph drivers registered".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_active_mounts_refcount() {
        let mounts = ActiveMounts::new();
        let mut mounted = 0;

        mounts
            .acquire("a", || {
                mounted += 1;
                Ok(PathBuf::from("/mnt/a"))
            })
            .unwrap();
        let again = mounts.acquire("a", || panic!("mounted twice")).unwrap();
        assert_eq!(again, PathBuf::from("/mnt/a"));
        assert_eq!(mounted, 1);
        assert_eq!(mounts.count("a"), 2);

        mounts.release("a", |_| panic!("unmounted early")).unwrap();
        let mut unmounted = false;
        mounts
            .release("a", |_| {
                unmounted = true;
                Ok(())
            })
            .unwrap();
        assert!(unmounted);
        assert_eq!(mounts.count("a"), 0);

        // Releasing an unreferenced layer is a no-op
        mounts.release("a", |_| panic!("not mounted")).unwrap();
    }

    #[test]
    fn test_failed_mount_not_recorded() {
        let mounts = ActiveMounts::new();
        let result = mounts.acquire("a", || Err(Error::Internal("boom".to_string())));
        assert!(result.is_err());
        assert_eq!(mounts.count("a"), 0);
    }

    #[test]
    fn test_registry_unknown_driver() {
        let temp = TempDir::new().unwrap();
        let registry = DriverRegistry::with_defaults();
        let result = registry.new_driver("zfs", temp.path(), &[]);
        assert!(matches!(result, Err(Error::DriverNotSupported(_))));
    }

    #[test]
    fn test_registry_prefers_existing_state() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("vfs/dir")).unwrap();

        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["layered", "vfs"]);
        let driver = registry.new_driver("", temp.path(), &[]).unwrap();
        assert_eq!(driver.name(), "vfs");
    }

    #[test]
    fn test_registry_default_priority() {
        let temp = TempDir::new().unwrap();
        let registry = DriverRegistry::with_defaults();
        let driver = registry.new_driver("", temp.path(), &[]).unwrap();
        assert_eq!(driver.name(), "layered");
    }
}
