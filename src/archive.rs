//! Layer archives and filesystem change sets.
//!
//! Everything a graph driver needs to move layer content around without
//! knowing anything about mounts:
//!
//! - [`changes_dirs`]: compare two directory trees and list what changed
//! - [`export_changes`]: pack a change set into a tar stream, encoding
//!   deletions as `.wh.` whiteout entries
//! - [`apply_layer`]: unpack a (possibly gzip-compressed) layer tar onto a
//!   directory, honoring whiteouts
//! - [`changes_size`]: bytes contributed by a change set
//! - [`copy_dir`]: full tree copy that preserves metadata
//!
//! ## Security Model
//!
//! [`apply_layer`] rejects any entry whose path is absolute or contains a
//! `..` component, any entry whose parent directory is a symlink resolving
//! outside the destination, and any hard link whose target is absolute or
//! climbs with `..`. The whole apply fails with [`Error::PathTraversal`];
//! nothing is silently skipped.
//!
//! ## Change Detection
//!
//! A path present on both sides is reported as modified when its file type,
//! permission bits, owner, group or device number differ, or for
//! non-directories when size or mtime differ. Directory size and mtime are
//! ignored: they change whenever a child is written, which would report
//! every ancestor of a written file. Mtimes compare equal when the seconds
//! match and either the nanoseconds match or one side has none (tar only
//! records whole seconds).

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Prefix marking a whiteout entry in a layer archive.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout entry marking its directory as opaque (lower content hidden).
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// A layer archive stream.
pub type LayerArchive = Box<dyn Read + Send>;

// =============================================================================
// Change Sets
// =============================================================================

/// Kind of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Present on both sides with different metadata.
    Modified,
    /// Only present on the new side.
    Added,
    /// Only present on the old side.
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Modified => write!(f, "C"),
            Self::Added => write!(f, "A"),
            Self::Deleted => write!(f, "D"),
        }
    }
}

/// A single change, with `path` rooted at `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Path relative to the layer root.
    pub fn relative_path(&self) -> &Path {
        Path::new(self.path.trim_start_matches('/'))
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// The metadata that decides whether a path changed.
#[derive(Debug, Clone, Copy)]
struct FileStat {
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    is_dir: bool,
}

impl FileStat {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            is_dir: meta.is_dir(),
        }
    }

    fn differs_from(&self, other: &FileStat) -> bool {
        if self.mode != other.mode
            || self.uid != other.uid
            || self.gid != other.gid
            || self.rdev != other.rdev
        {
            return true;
        }
        if self.is_dir {
            return false;
        }
        self.size != other.size || !same_mtime(self, other)
    }
}

fn same_mtime(a: &FileStat, b: &FileStat) -> bool {
    a.mtime == b.mtime
        && (a.mtime_nsec == b.mtime_nsec || a.mtime_nsec == 0 || b.mtime_nsec == 0)
}

/// Returns true when `new` counts as a modification of `old`.
pub fn metadata_differs(new: &fs::Metadata, old: &fs::Metadata) -> bool {
    FileStat::from_metadata(new).differs_from(&FileStat::from_metadata(old))
}

/// Collects every path below `root` (relative, root itself excluded).
fn collect_tree(root: &Path) -> Result<BTreeMap<PathBuf, FileStat>> {
    let mut tree = BTreeMap::new();
    walk(root, Path::new(""), &mut |rel, meta| {
        tree.insert(rel.to_path_buf(), FileStat::from_metadata(meta));
    })?;
    Ok(tree)
}

/// Walks `root` depth-first without following symlinks.
pub(crate) fn walk(
    root: &Path,
    rel: &Path,
    callback: &mut impl FnMut(&Path, &fs::Metadata),
) -> Result<()> {
    let dir = root.join(rel);
    let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let child_rel = rel.join(entry.file_name());
        let meta = fs::symlink_metadata(entry.path())?;
        callback(&child_rel, &meta);
        if meta.is_dir() {
            walk(root, &child_rel, callback)?;
        }
    }
    Ok(())
}

fn rooted(rel: &Path) -> String {
    format!("/{}", rel.to_string_lossy())
}

/// Lists the changes that turn `old_dir` into `new_dir`.
///
/// With no `old_dir`, every path in `new_dir` is reported as added. Deleted
/// directories are reported once; their children are implied.
pub fn changes_dirs(new_dir: &Path, old_dir: Option<&Path>) -> Result<Vec<Change>> {
    let new_tree = collect_tree(new_dir)?;
    let old_tree = match old_dir {
        Some(dir) => collect_tree(dir)?,
        None => BTreeMap::new(),
    };

    let mut changes = Vec::new();

    for (path, stat) in &new_tree {
        match old_tree.get(path) {
            None => changes.push(Change::new(rooted(path), ChangeKind::Added)),
            Some(old) if stat.differs_from(old) => {
                changes.push(Change::new(rooted(path), ChangeKind::Modified))
            }
            Some(_) => {}
        }
    }

    for path in old_tree.keys() {
        if new_tree.contains_key(path) {
            continue;
        }
        let parent_gone = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .is_some_and(|p| old_tree.contains_key(p) && !new_tree.contains_key(p));
        if !parent_gone {
            changes.push(Change::new(rooted(path), ChangeKind::Deleted));
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

/// Returns the bytes a change set adds to `dir`.
///
/// Hard links to the same inode are counted once.
pub fn changes_size(dir: &Path, changes: &[Change]) -> u64 {
    let mut seen = HashSet::new();
    let mut size = 0u64;

    for change in changes {
        if change.kind == ChangeKind::Deleted {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(dir.join(change.relative_path())) else {
            continue;
        };
        if meta.is_dir() {
            continue;
        }
        if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        size += meta.size();
    }
    size
}

// =============================================================================
// Export
// =============================================================================

/// Packs `changes` found in `dir` into an uncompressed tar archive.
pub fn export_changes(dir: &Path, changes: &[Change]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut sorted: Vec<&Change> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    for change in sorted {
        let rel = change.relative_path();
        match change.kind {
            ChangeKind::Deleted => {
                let name = rel
                    .file_name()
                    .ok_or_else(|| Error::Internal(format!("change without name: {}", change)))?;
                let whiteout = rel
                    .parent()
                    .unwrap_or(Path::new(""))
                    .join(format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy()));

                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
                builder.append_data(&mut header, &whiteout, std::io::empty())?;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                let full = dir.join(rel);
                let meta = fs::symlink_metadata(&full)?;
                let ft = meta.file_type();
                if ft.is_socket() {
                    debug!("skipping socket {}", full.display());
                    continue;
                }
                builder.append_path_with_name(&full, rel)?;
            }
        }
    }

    Ok(builder.into_inner()?)
}

/// Packs the whole tree below `dir` into an uncompressed tar archive.
pub fn tar_dir(dir: &Path) -> Result<Vec<u8>> {
    let changes = changes_dirs(dir, None)?;
    export_changes(dir, &changes)
}

// =============================================================================
// Apply
// =============================================================================

/// Wraps a layer stream, transparently decompressing gzip input.
pub fn decompress_stream<'a, R: Read + 'a>(reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut buffered = BufReader::new(reader);
    let head = buffered.fill_buf()?;
    if head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b {
        Ok(Box::new(GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Normalizes an archive entry path, rejecting anything that escapes.
fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().into_owned(),
                });
            }
        }
    }
    Ok(clean)
}

/// Removes a file, symlink or directory tree. Missing paths are fine.
pub(crate) fn remove_any(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fails when a directory on the way from `dest` to `parent` is a symlink
/// resolving outside `dest`, or is not a directory at all.
///
/// Must run before any whiteout or overwrite removes something.
fn check_parents(dest: &Path, parent: &Path) -> Result<()> {
    let root = fs::canonicalize(dest)?;
    let traversal = || Error::PathTraversal {
        path: parent.to_string_lossy().into_owned(),
    };

    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        let meta = match fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() {
            match fs::canonicalize(&current) {
                Ok(resolved) if resolved.starts_with(&root) && resolved.is_dir() => {}
                _ => return Err(traversal()),
            }
        } else if !meta.is_dir() {
            return Err(traversal());
        }
    }
    Ok(())
}

/// How whiteout entries are treated while unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whiteouts {
    /// Delete the whited-out path from the destination.
    Apply,
    /// Keep the marker files; the destination is an upper directory.
    Preserve,
}

/// Unpacks a layer archive onto `dest`, returning the bytes written.
///
/// # Security
///
/// Entries with absolute paths or `..` components, entries below a symlink
/// that leaves `dest`, and hard links pointing outside `dest`, abort the
/// apply with [`Error::PathTraversal`] before anything is removed.
pub fn apply_layer(dest: &Path, layer: impl Read) -> Result<u64> {
    unpack_layer(dest, layer, Whiteouts::Apply)
}

/// Unpacks a layer archive onto `dest` with the given whiteout handling.
pub fn unpack_layer(dest: &Path, layer: impl Read, whiteouts: Whiteouts) -> Result<u64> {
    let reader = decompress_stream(layer)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    let mut size = 0u64;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let rel = safe_relative(&raw_path)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        if entry.header().entry_type() == tar::EntryType::Link
            && let Some(target) = entry.link_name()?
        {
            safe_relative(&target)?;
        }

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = rel.parent().unwrap_or(Path::new(""));
        check_parents(dest, parent)?;

        if whiteouts == Whiteouts::Apply {
            if file_name == WHITEOUT_OPAQUE {
                let dir = dest.join(parent);
                if dir.is_dir() {
                    for child in fs::read_dir(&dir)? {
                        remove_any(&child?.path())?;
                    }
                }
                continue;
            }
            if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                remove_any(&dest.join(parent).join(target))?;
                continue;
            }
        } else if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX)
            && file_name != WHITEOUT_OPAQUE
        {
            // A marker and the path it hides never coexist in one upper dir.
            remove_any(&dest.join(parent).join(target))?;
        } else {
            let marker = format!("{}{}", WHITEOUT_PREFIX, file_name);
            remove_any(&dest.join(parent).join(marker))?;
        }

        let target = dest.join(&rel);
        let is_dir_entry = entry.header().entry_type() == tar::EntryType::Directory;
        if let Ok(existing) = fs::symlink_metadata(&target)
            && !(existing.is_dir() && is_dir_entry)
        {
            remove_any(&target)?;
        }

        size += entry.header().size().unwrap_or(0);

        if !entry.unpack_in(dest)? {
            return Err(Error::PathTraversal {
                path: raw_path.to_string_lossy().into_owned(),
            });
        }
    }

    Ok(size)
}

// =============================================================================
// Copy
// =============================================================================

/// Sets atime/mtime on `path` without following symlinks.
fn copy_times(path: &Path, meta: &fs::Metadata) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::Internal(format!("path contains NUL: {}", e)))?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as _,
        },
    ];
    // SAFETY: c_path is a valid NUL-terminated string and times has two entries.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn copy_owner(path: &Path, meta: &fs::Metadata) {
    if let Err(e) = std::os::unix::fs::lchown(path, Some(meta.uid()), Some(meta.gid())) {
        debug!("cannot preserve ownership of {}: {}", path.display(), e);
    }
}

/// Copies a single non-directory entry, preserving its metadata.
///
/// Returns false for entries that cannot be copied (sockets, devices).
pub fn copy_entry(from: &Path, to: &Path, meta: &fs::Metadata) -> Result<bool> {
    let ft = meta.file_type();
    if ft.is_symlink() {
        let target = fs::read_link(from)?;
        std::os::unix::fs::symlink(&target, to)?;
    } else if ft.is_file() {
        fs::copy(from, to)?;
    } else {
        warn!("skipping special file {}", from.display());
        return Ok(false);
    }
    copy_owner(to, meta);
    copy_times(to, meta)?;
    Ok(true)
}

/// Applies owner, permissions and timestamps of `meta` to the directory `path`.
pub fn copy_dir_metadata(path: &Path, meta: &fs::Metadata) -> Result<()> {
    copy_owner(path, meta);
    fs::set_permissions(path, meta.permissions())?;
    copy_times(path, meta)
}

/// Copies the tree below `src` into the existing directory `dst`.
///
/// Permissions, timestamps and symlinks are preserved; ownership is
/// preserved when the process is allowed to change it.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let mut dirs = Vec::new();
    copy_tree(src, dst, Path::new(""), &mut dirs)?;

    // Directory metadata last, once children stopped touching it.
    for (path, meta) in dirs.iter().rev() {
        copy_dir_metadata(path, meta)?;
    }
    Ok(())
}

fn copy_tree(
    src: &Path,
    dst: &Path,
    rel: &Path,
    dirs: &mut Vec<(PathBuf, fs::Metadata)>,
) -> Result<()> {
    for entry in fs::read_dir(src.join(rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        let from = src.join(&child);
        let to = dst.join(&child);
        let meta = fs::symlink_metadata(&from)?;

        if meta.is_dir() {
            fs::create_dir(&to)?;
            dirs.push((to, meta));
            copy_tree(src, dst, &child, dirs)?;
        } else {
            copy_entry(&from, &to, &meta)?;
        }
    }
    Ok(())
}
