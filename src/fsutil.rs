//! Filesystem helpers shared by the stores.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Maximum symlinks followed while resolving a path inside a root.
const MAX_SYMLINK_DEPTH: usize = 255;

/// Writes `data` to `path` atomically via a temp file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent directory for {}", path.display())))?;
    let temp = parent.join(format!(".tmp-{}", uuid::Uuid::now_v7()));

    if let Err(e) = fs::write(&temp, data) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// Resolves `path` as seen from inside `root`.
///
/// `..` components and symlinks (absolute or relative) never leave `root`:
/// they are evaluated as if `root` were `/`. The result may not exist.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: Vec<PathBuf> = vec![path.to_path_buf()];
    let mut links = 0;

    while let Some(next) = pending.pop() {
        let mut components = next.components();
        let Some(component) = components.next() else {
            continue;
        };
        let rest = components.as_path().to_path_buf();
        if !rest.as_os_str().is_empty() {
            pending.push(rest);
        }

        match component {
            Component::RootDir | Component::Prefix(_) => resolved.clear(),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                let full = root.join(&candidate);
                match fs::symlink_metadata(&full) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        links += 1;
                        if links > MAX_SYMLINK_DEPTH {
                            return Err(Error::InvalidConfig(format!(
                                "too many symlinks resolving {} in {}",
                                path.display(),
                                root.display()
                            )));
                        }
                        let target = fs::read_link(&full)?;
                        if target.is_absolute() {
                            resolved.clear();
                        }
                        pending.push(target);
                    }
                    _ => resolved = candidate,
                }
            }
        }
    }

    Ok(root.join(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_resolve_stays_in_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("srv")).unwrap();
        std::os::unix::fs::symlink("/etc", root.join("srv/etc")).unwrap();
        std::os::unix::fs::symlink("../../..", root.join("srv/up")).unwrap();

        assert_eq!(
            resolve_in_root(root, Path::new("/srv/etc/passwd")).unwrap(),
            root.join("etc/passwd")
        );
        assert_eq!(
            resolve_in_root(root, Path::new("../../x")).unwrap(),
            root.join("x")
        );
        assert_eq!(
            resolve_in_root(root, Path::new("/srv/up/tmp")).unwrap(),
            root.join("tmp")
        );
    }
}
