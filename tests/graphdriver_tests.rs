//! Tests for the graph drivers through the registry.

use magikd::{Change, ChangeKind, DriverRegistry, Error, GraphDriver};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const DRIVERS: &[&str] = &["vfs", "layered"];

fn driver(name: &str, root: &Path) -> Arc<dyn GraphDriver> {
    DriverRegistry::with_defaults()
        .new_driver(name, root, &[])
        .unwrap()
}

fn active_layers(driver: &dyn GraphDriver) -> String {
    driver
        .status()
        .into_iter()
        .find(|(k, _)| k == "Active Layers")
        .map(|(_, v)| v)
        .unwrap()
}

/// Builds `base` with three files and `child` on top that adds, modifies
/// and deletes one each.
fn base_and_child(driver: &dyn GraphDriver) {
    driver.create("base", "").unwrap();
    let base = driver.get("base", "").unwrap();
    fs::write(base.join("keep.txt"), b"keep").unwrap();
    fs::write(base.join("edit.txt"), b"old").unwrap();
    fs::write(base.join("gone.txt"), b"gone").unwrap();
    driver.put("base").unwrap();

    driver.create("child", "base").unwrap();
    let child = driver.get("child", "").unwrap();
    fs::write(child.join("new.txt"), b"new").unwrap();
    fs::write(child.join("edit.txt"), b"changed content").unwrap();
    fs::remove_file(child.join("gone.txt")).unwrap();
    driver.put("child").unwrap();
}

fn file_changes(changes: Vec<Change>) -> Vec<Change> {
    let mut changes: Vec<Change> = changes.into_iter().filter(|c| c.path != "/").collect();
    changes.sort();
    changes
}

fn expected_changes() -> Vec<Change> {
    let mut expected = vec![
        Change::new("/new.txt", ChangeKind::Added),
        Change::new("/edit.txt", ChangeKind::Modified),
        Change::new("/gone.txt", ChangeKind::Deleted),
    ];
    expected.sort();
    expected
}

// =============================================================================
// Registry
// =============================================================================

#[test]
fn test_registry_lists_builtin_drivers() {
    assert_eq!(DriverRegistry::with_defaults().names(), vec!["layered", "vfs"]);
}

#[test]
fn test_registry_selects_driver_with_prior_state() {
    let temp = TempDir::new().unwrap();
    driver("vfs", temp.path()).create("a", "").unwrap();

    let selected = DriverRegistry::with_defaults()
        .new_driver("", temp.path(), &[])
        .unwrap();
    assert_eq!(selected.name(), "vfs");
}

#[test]
fn test_registry_rejects_unknown_options() {
    let temp = TempDir::new().unwrap();
    for name in DRIVERS {
        let result = DriverRegistry::with_defaults().new_driver(name, temp.path(), &["size=10G".to_string()]);
        assert!(result.is_err(), "{} accepted an unknown option", name);
    }
}

// =============================================================================
// Layers
// =============================================================================

#[test]
fn test_child_inherits_parent_content() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        base_and_child(driver.as_ref());

        let child = driver.get("child", "").unwrap();
        assert_eq!(fs::read(child.join("keep.txt")).unwrap(), b"keep");
        assert_eq!(fs::read(child.join("edit.txt")).unwrap(), b"changed content");
        assert!(!child.join("gone.txt").exists());
        driver.put("child").unwrap();

        let base = driver.get("base", "").unwrap();
        assert_eq!(fs::read(base.join("edit.txt")).unwrap(), b"old");
        assert!(base.join("gone.txt").exists());
        assert!(!base.join("new.txt").exists());
        driver.put("base").unwrap();
    }
}

#[test]
fn test_create_with_unknown_parent_fails() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());

        assert!(driver.create("orphan", "missing").is_err());
        assert!(!driver.exists("orphan"), "{} left a partial layer", name);
    }
}

#[test]
fn test_get_unknown_layer_fails() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());

        assert!(driver.get("missing", "").is_err());
        assert_eq!(active_layers(driver.as_ref()), "0");
    }
}

#[test]
fn test_remove_layer() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        driver.create("a", "").unwrap();

        driver.remove("a").unwrap();
        assert!(!driver.exists("a"));
        assert!(matches!(driver.remove("a"), Err(Error::LayerNotFound(_))));
    }
}

#[test]
fn test_concurrent_get_put_keeps_refcount() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        driver.create("shared", "").unwrap();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let driver = driver.clone();
                scope.spawn(move || {
                    let dir = driver.get("shared", "").unwrap();
                    fs::write(dir.join(format!("file-{}", i)), i.to_string()).unwrap();
                    driver.put("shared").unwrap();
                });
            }
        });
        assert_eq!(active_layers(driver.as_ref()), "0");

        let dir = driver.get("shared", "").unwrap();
        for i in 0..8 {
            assert!(dir.join(format!("file-{}", i)).exists(), "{} lost file-{}", name, i);
        }
        driver.put("shared").unwrap();
    }
}

#[test]
fn test_cleanup_releases_everything() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        driver.create("a", "").unwrap();
        let dir = driver.get("a", "").unwrap();
        driver.get("a", "").unwrap();
        fs::write(dir.join("late.txt"), b"late").unwrap();

        driver.cleanup().unwrap();
        assert_eq!(active_layers(driver.as_ref()), "0");

        let dir = driver.get("a", "").unwrap();
        assert!(dir.join("late.txt").exists());
        driver.put("a").unwrap();
    }
}

// =============================================================================
// Diffs
// =============================================================================

#[test]
fn test_changes_only_report_child_writes() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        base_and_child(driver.as_ref());

        let changes = file_changes(driver.changes("child", "base").unwrap());
        assert_eq!(changes, expected_changes(), "driver {}", name);
    }
}

#[test]
fn test_changes_against_empty_parent_lists_everything() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        base_and_child(driver.as_ref());

        let changes = file_changes(driver.changes("base", "").unwrap());
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Added));
        assert_eq!(changes.len(), 3, "driver {}", name);
    }
}

#[test]
fn test_diff_applies_across_drivers() {
    for from in DRIVERS {
        for to in DRIVERS {
            let temp = TempDir::new().unwrap();
            let source = driver(from, &temp.path().join("source"));
            let target = driver(to, &temp.path().join("target"));
            base_and_child(source.as_ref());
            base_and_child(target.as_ref());

            let diff = source.diff("child", "base").unwrap();
            target.create("replayed", "base").unwrap();
            let size = target.apply_diff("replayed", "base", diff).unwrap();
            assert!(size > 0);

            let replayed = file_changes(target.changes("replayed", "base").unwrap());
            assert_eq!(replayed, expected_changes(), "{} -> {}", from, to);

            let dir = target.get("replayed", "").unwrap();
            assert_eq!(fs::read(dir.join("edit.txt")).unwrap(), b"changed content");
            assert!(!dir.join("gone.txt").exists());
            target.put("replayed").unwrap();
        }
    }
}

#[test]
fn test_diff_size_counts_new_content() {
    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, temp.path());
        base_and_child(driver.as_ref());

        let size = driver.diff_size("child", "base").unwrap();
        assert_eq!(size, "new".len() as u64 + "changed content".len() as u64, "driver {}", name);
    }
}

#[test]
fn test_apply_rejects_path_traversal() {
    let mut header = tar::Header::new_old();
    let name = b"../escape.txt";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..]).unwrap();
    let data = builder.into_inner().unwrap();

    for name in DRIVERS {
        let temp = TempDir::new().unwrap();
        let driver = driver(name, &temp.path().join("root"));
        driver.create("a", "").unwrap();

        let result = driver.apply_diff("a", "", Box::new(std::io::Cursor::new(data.clone())));
        assert!(matches!(result, Err(Error::PathTraversal { .. })), "driver {}", name);
        assert!(!temp.path().join("root").join("escape.txt").exists());
    }
}

/// A layer that plants `link -> outside` and then reaches through it.
fn through_symlink(outside: &Path, entry: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    link.set_link_name(outside).unwrap();
    builder.append_data(&mut link, "link", std::io::empty()).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(4);
    header.set_mode(0o644);
    builder.append_data(&mut header, entry, &b"evil"[..]).unwrap();

    builder.into_inner().unwrap()
}

#[test]
fn test_apply_does_not_follow_symlink_out_of_root() {
    for entry in ["link/.wh.victim", "link/.wh..wh..opq", "link/victim"] {
        for name in DRIVERS {
            let temp = TempDir::new().unwrap();
            let outside = temp.path().join("outside");
            fs::create_dir(&outside).unwrap();
            fs::write(outside.join("victim"), b"keep").unwrap();
            fs::write(outside.join("other"), b"keep").unwrap();

            let driver = driver(name, &temp.path().join("root"));
            driver.create("a", "").unwrap();
            let data = through_symlink(&outside, entry);

            let result = driver.apply_diff("a", "", Box::new(std::io::Cursor::new(data)));
            assert!(
                matches!(result, Err(Error::PathTraversal { .. })),
                "driver {} entry {}: {:?}",
                name,
                entry,
                result
            );
            assert_eq!(fs::read(outside.join("victim")).unwrap(), b"keep", "driver {} entry {}", name, entry);
            assert_eq!(fs::read(outside.join("other")).unwrap(), b"keep", "driver {} entry {}", name, entry);
        }
    }
}

#[test]
fn test_apply_follows_symlink_inside_root() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    builder.append_data(&mut dir, "usr/lib", std::io::empty()).unwrap();
    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    link.set_link_name("usr/lib").unwrap();
    builder.append_data(&mut link, "lib", std::io::empty()).unwrap();
    let mut file = tar::Header::new_gnu();
    file.set_entry_type(tar::EntryType::Regular);
    file.set_size(2);
    file.set_mode(0o644);
    builder.append_data(&mut file, "lib/libc.so", &b"so"[..]).unwrap();
    let data = builder.into_inner().unwrap();

    let temp = TempDir::new().unwrap();
    let driver = driver("vfs", temp.path());
    driver.create("a", "").unwrap();
    driver.apply_diff("a", "", Box::new(std::io::Cursor::new(data))).unwrap();

    let dir = driver.get("a", "").unwrap();
    assert_eq!(fs::read(dir.join("usr/lib/libc.so")).unwrap(), b"so");
    driver.put("a").unwrap();
}
