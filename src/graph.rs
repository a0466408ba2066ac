//! # Image Graph
//!
//! Content-addressed store of immutable images built on a [`GraphDriver`].
//!
//! ## Registration Ordering
//!
//! ```text
//! validate ID ─► refuse existing ─► purge stale dir + layer
//!      ─► driver.create ─► apply layer ─► write json into _tmp/<uuid>
//!      ─► rename into <root>/<id>   (commit point)
//!      ─► index
//! ```
//!
//! Nothing is addressable before the rename, so a failure at any earlier
//! step leaves `exists(id) == false`. Failed steps also remove the driver
//! layer this registration created, and the temp directory.
//!
//! Registrations and deletions of one graph are serialized.
//!
//! ## Deletion Ordering
//!
//! The image leaves the index, its directory is renamed into `_tmp`, the
//! driver drops the layer, and the moved directory is deleted. An
//! interrupted delete never leaves a half-deleted image addressable.

use crate::archive::LayerArchive;
use crate::constants::{GRAPH_TMP_DIR, generate_id};
use crate::error::{Error, Result};
use crate::graphdriver::GraphDriver;
use crate::image::Image;
use crate::runconfig::RunConfig;
use crate::truncindex::TruncIndex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Store of images keyed by ID.
pub struct Graph {
    root: PathBuf,
    id_index: TruncIndex,
    driver: Arc<dyn GraphDriver>,
    /// Held across register and delete.
    write_lock: Mutex<()>,
}

/// Removes a directory on drop unless disarmed.
struct TempDirGuard {
    path: PathBuf,
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = fs::remove_dir_all(&self.path)
        {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

impl Graph {
    /// Opens the graph at `root`, indexing images the driver still has.
    pub fn new(root: &Path, driver: Arc<dyn GraphDriver>) -> Result<Self> {
        fs::create_dir_all(root)?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700))?;

        let mut ids = Vec::new();
        for entry in fs::read_dir(root)? {
            let id = entry?.file_name().to_string_lossy().into_owned();
            if id == GRAPH_TMP_DIR {
                continue;
            }
            if driver.exists(&id) {
                ids.push(id);
            } else {
                debug!("skipping image {} without layer in {}", id, driver.name());
            }
        }

        let graph = Self {
            root: root.to_path_buf(),
            id_index: TruncIndex::from_ids(ids)?,
            driver,
            write_lock: Mutex::new(()),
        };
        info!("restored {} image(s) from {}", graph.id_index.len(), root.display());
        Ok(graph)
    }

    /// The graph driver holding image layers.
    pub fn driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    fn image_root(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| Error::Internal(format!("graph lock poisoned: {}", e)))
    }

    fn mktemp(&self) -> Result<TempDirGuard> {
        let path = self
            .root
            .join(GRAPH_TMP_DIR)
            .join(uuid::Uuid::now_v7().to_string());
        fs::create_dir_all(&path)?;
        Ok(TempDirGuard { path })
    }

    fn resolve(&self, name: &str) -> Result<String> {
        self.id_index
            .get(name)?
            .ok_or_else(|| Error::ImageNotFound(name.to_string()))
    }

    /// Returns true if `name` resolves to a registered image.
    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Looks up an image by ID or unique ID prefix.
    ///
    /// The layer size is computed on first access and cached on disk.
    pub fn get(&self, name: &str) -> Result<Image> {
        let id = self.resolve(name)?;
        let dir = self.image_root(&id);
        let mut img = Image::load(&dir)?;
        if img.id != id {
            return Err(Error::CorruptRecord {
                path: dir,
                reason: format!("image stored at '{}' has wrong id '{}'", id, img.id),
            });
        }

        if !Image::has_size(&dir) {
            img.size = self.driver.diff_size(&img.id, &img.parent)?;
            img.save_size(&dir)?;
        }
        Ok(img)
    }

    /// Creates and registers a new image.
    ///
    /// With a `container_id` the image records where it came from and
    /// uses `container_image` as its parent.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        layer_data: Option<LayerArchive>,
        container_id: &str,
        container_image: &str,
        comment: &str,
        author: &str,
        container_config: Option<&RunConfig>,
        config: Option<RunConfig>,
    ) -> Result<Image> {
        let mut img = Image::new(generate_id(), "");
        img.comment = comment.to_string();
        img.author = author.to_string();
        img.config = config;
        if !container_id.is_empty() {
            img.parent = container_image.to_string();
            img.container = container_id.to_string();
            img.container_config = container_config.cloned().unwrap_or_default();
        }

        self.register(&mut img, layer_data)?;
        Ok(img)
    }

    /// Stores `img` with its layer content.
    ///
    /// On success `img.size` holds the bytes the layer adds.
    pub fn register(&self, img: &mut Image, layer_data: Option<LayerArchive>) -> Result<()> {
        img.validate()?;
        let _writes = self.lock_writes()?;
        if self.exists(&img.id) {
            return Err(Error::ImageAlreadyExists(img.id.clone()));
        }
        if !img.parent.is_empty() && !self.exists(&img.parent) {
            return Err(Error::ImageNotFound(img.parent.clone()));
        }

        // The graph is authoritative: anything on disk for an unregistered ID is stale.
        let root = self.image_root(&img.id);
        if root.exists() {
            warn!("removing stale image directory {}", root.display());
            fs::remove_dir_all(&root)?;
        }
        if self.driver.exists(&img.id) {
            warn!("removing stale layer {} from {}", img.id, self.driver.name());
            if let Err(e) = self.driver.remove(&img.id) {
                warn!("failed to remove stale layer {}: {}", img.id, e);
            }
        }

        let tmp = self.mktemp()?;
        self.driver.create(&img.id, &img.parent)?;
        let stored = self
            .store(img, layer_data, &tmp.path)
            .and_then(|()| fs::rename(&tmp.path, &root).map_err(Error::from));
        if let Err(e) = stored {
            if let Err(cleanup) = self.driver.remove(&img.id) {
                warn!("failed to clean up layer {}: {}", img.id, cleanup);
            }
            return Err(e);
        }

        self.id_index.add(&img.id)?;
        info!("registered image {}", img.id);
        Ok(())
    }

    fn store(&self, img: &mut Image, layer_data: Option<LayerArchive>, tmp: &Path) -> Result<()> {
        img.size = match layer_data {
            Some(data) => self.driver.apply_diff(&img.id, &img.parent, data)?,
            None => 0,
        };
        img.save(tmp)?;
        img.save_size(tmp)
    }

    /// Deletes an image by ID or unique prefix.
    pub fn delete(&self, name: &str) -> Result<()> {
        let _writes = self.lock_writes()?;
        let id = self.resolve(name)?;
        let tmp = self.mktemp()?;
        self.id_index.delete(&id)?;

        let moved = tmp.path.join("img");
        if let Err(e) = fs::rename(self.image_root(&id), &moved) {
            self.id_index.add(&id)?;
            return Err(e.into());
        }
        if let Err(e) = self.driver.remove(&id) {
            warn!("failed to remove layer {}: {}", id, e);
        }
        info!("deleted image {}", id);
        Ok(())
    }

    /// Calls `f` for every loadable image.
    pub fn walk_all(&self, mut f: impl FnMut(Image)) {
        for id in self.id_index.ids() {
            match self.get(&id) {
                Ok(img) => f(img),
                Err(e) => warn!("skipping unreadable image {}: {}", id, e),
            }
        }
    }

    /// Every image, keyed by ID.
    pub fn map(&self) -> HashMap<String, Image> {
        let mut images = HashMap::new();
        self.walk_all(|img| {
            images.insert(img.id.clone(), img);
        });
        images
    }

    /// Parent ID to the images built on it.
    pub fn by_parent(&self) -> HashMap<String, Vec<Image>> {
        let images = self.map();
        let mut children: HashMap<String, Vec<Image>> = HashMap::new();
        for img in images.values() {
            if img.parent.is_empty() || !images.contains_key(&img.parent) {
                continue;
            }
            children
                .entry(img.parent.clone())
                .or_default()
                .push(img.clone());
        }
        children
    }

    /// Images nothing is built on.
    pub fn heads(&self) -> HashMap<String, Image> {
        let parents: HashSet<String> = self.by_parent().into_keys().collect();
        self.map()
            .into_iter()
            .filter(|(id, _)| !parents.contains(id))
            .collect()
    }

    /// Newest child of `parent_id` committed from a container running `config`.
    pub fn get_cached(&self, parent_id: &str, config: &RunConfig) -> Result<Option<Image>> {
        let parent = self.get(parent_id)?;
        let children = self.by_parent().remove(&parent.id).unwrap_or_default();
        Ok(children
            .into_iter()
            .filter(|img| &img.container_config == config)
            .max_by_key(|img| img.created))
    }

    /// Archive of the layer an image adds over its parent.
    pub fn tar_layer(&self, img: &Image) -> Result<LayerArchive> {
        self.driver.diff(&img.id, &img.parent)
    }

    /// Number of registered images.
    pub fn len(&self) -> usize {
        self.id_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_index.is_empty()
    }
}
