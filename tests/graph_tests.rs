//! Tests for the image graph.

use magikd::{DriverRegistry, Error, Graph, GraphDriver, Image, LayerArchive, RunConfig, generate_id};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open(root: &Path) -> Graph {
    let driver: Arc<dyn GraphDriver> = DriverRegistry::with_defaults()
        .new_driver("vfs", root, &[])
        .unwrap();
    Graph::new(&root.join("graph"), driver).unwrap()
}

/// A one-file layer archive.
fn layer(name: &str, content: &[u8]) -> LayerArchive {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, content).unwrap();
    Box::new(Cursor::new(builder.into_inner().unwrap()))
}

fn escaping_layer() -> LayerArchive {
    let mut header = tar::Header::new_old();
    let name = b"../escape.txt";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..]).unwrap();
    Box::new(Cursor::new(builder.into_inner().unwrap()))
}

// =============================================================================
// Register & Get
// =============================================================================

#[test]
fn test_create_and_get() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let config = RunConfig {
        cmd: vec!["/bin/sh".to_string()],
        ..Default::default()
    };

    let img = graph
        .create(Some(layer("hello.txt", b"hello")), "", "", "first", "me", None, Some(config.clone()))
        .unwrap();

    assert_eq!(img.size, 5);
    assert!(graph.exists(&img.id));
    assert!(graph.exists(&img.id[..10]));
    let loaded = graph.get(&img.id[..10]).unwrap();
    assert_eq!(loaded.id, img.id);
    assert_eq!(loaded.comment, "first");
    assert_eq!(loaded.author, "me");
    assert_eq!(loaded.config, Some(config));
    assert_eq!(loaded.size, 5);
    assert_eq!(graph.len(), 1);
}

#[test]
fn test_get_unknown_image() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    assert!(matches!(graph.get("deadbeef"), Err(Error::ImageNotFound(_))));
    assert!(!graph.exists("deadbeef"));
}

#[test]
fn test_register_child_requires_parent() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let mut img = Image::new(generate_id(), generate_id());

    assert!(matches!(graph.register(&mut img, None), Err(Error::ImageNotFound(_))));
    assert!(!graph.exists(&img.id));
}

#[test]
fn test_register_twice_fails() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let mut img = Image::new(generate_id(), "");
    graph.register(&mut img, None).unwrap();

    assert!(matches!(
        graph.register(&mut img, None),
        Err(Error::ImageAlreadyExists(_))
    ));
}

#[test]
fn test_failed_register_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let mut img = Image::new(generate_id(), "");

    assert!(graph.register(&mut img, Some(escaping_layer())).is_err());

    assert!(!graph.exists(&img.id));
    assert!(!graph.driver().exists(&img.id));
    assert!(!temp.path().join("graph").join(&img.id).exists());
    assert!(!temp.path().join("vfs").join("dir").join("escape.txt").exists());
    assert!(graph.is_empty());
}

#[test]
fn test_register_replaces_stale_layer() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let id = generate_id();
    graph.driver().create(&id, "").unwrap();

    let mut img = Image::new(id.clone(), "");
    graph.register(&mut img, Some(layer("a.txt", b"a"))).unwrap();
    assert!(graph.exists(&id));
}

#[test]
fn test_child_layer_sees_parent_files() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let parent = graph
        .create(Some(layer("base.txt", b"base")), "", "", "", "", None, None)
        .unwrap();
    let mut child = Image::new(generate_id(), parent.id.clone());
    graph.register(&mut child, Some(layer("child.txt", b"child"))).unwrap();

    let driver = graph.driver();
    let dir = driver.get(&child.id, "").unwrap();
    assert!(dir.join("base.txt").exists());
    assert!(dir.join("child.txt").exists());
    driver.put(&child.id).unwrap();

    assert_eq!(graph.get(&child.id).unwrap().size, 5);
}

#[test]
fn test_concurrent_register_keeps_winner_layer() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());

    for _ in 0..20 {
        let id = generate_id();
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let graph = &graph;
                    let id = id.clone();
                    scope.spawn(move || {
                        let mut img = Image::new(id, "");
                        graph.register(&mut img, Some(layer("a.txt", b"abc")))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, Error::ImageAlreadyExists(_)))
        );
        assert!(graph.driver().exists(&id), "layer of {} missing", id);
        assert_eq!(graph.get(&id).unwrap().size, 3);
    }
}

// =============================================================================
// Delete & Restore
// =============================================================================

#[test]
fn test_delete_image() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let img = graph.create(None, "", "", "", "", None, None).unwrap();

    graph.delete(&img.id).unwrap();
    assert!(!graph.exists(&img.id));
    assert!(!graph.driver().exists(&img.id));
    assert!(matches!(graph.delete(&img.id), Err(Error::ImageNotFound(_))));
}

#[test]
fn test_reopen_restores_images() {
    let temp = TempDir::new().unwrap();
    let id = {
        let graph = open(temp.path());
        graph.create(Some(layer("a.txt", b"abc")), "", "", "kept", "", None, None).unwrap().id
    };

    let graph = open(temp.path());
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.get(&id).unwrap().comment, "kept");
}

#[test]
fn test_reopen_skips_images_without_layer() {
    let temp = TempDir::new().unwrap();
    let id = {
        let graph = open(temp.path());
        let img = graph.create(None, "", "", "", "", None, None).unwrap();
        graph.driver().remove(&img.id).unwrap();
        img.id
    };

    let graph = open(temp.path());
    assert!(!graph.exists(&id));
}

#[test]
fn test_size_recomputed_when_missing() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let img = graph
        .create(Some(layer("a.txt", b"abcd")), "", "", "", "", None, None)
        .unwrap();
    fs::remove_file(temp.path().join("graph").join(&img.id).join(magikd::IMAGE_SIZE_FILE)).unwrap();

    assert_eq!(graph.get(&img.id).unwrap().size, 4);
    assert!(temp.path().join("graph").join(&img.id).join(magikd::IMAGE_SIZE_FILE).exists());
}

// =============================================================================
// Queries
// =============================================================================

#[test]
fn test_heads_and_by_parent() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let base = graph.create(None, "", "", "", "", None, None).unwrap();
    let mut a = Image::new(generate_id(), base.id.clone());
    let mut b = Image::new(generate_id(), base.id.clone());
    graph.register(&mut a, None).unwrap();
    graph.register(&mut b, None).unwrap();

    let by_parent = graph.by_parent();
    assert_eq!(by_parent[&base.id].len(), 2);

    let heads = graph.heads();
    assert_eq!(heads.len(), 2);
    assert!(heads.contains_key(&a.id));
    assert!(heads.contains_key(&b.id));
    assert_eq!(graph.map().len(), 3);
}

#[test]
fn test_get_cached_matches_container_config() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let base = graph.create(None, "", "", "", "", None, None).unwrap();
    let config = RunConfig {
        cmd: vec!["make".to_string()],
        ..Default::default()
    };
    let other = RunConfig {
        cmd: vec!["test".to_string()],
        ..Default::default()
    };
    let container = generate_id();

    graph.create(None, &container, &base.id, "", "", Some(&other), None).unwrap();
    let cached = graph
        .create(None, &container, &base.id, "", "", Some(&config), None)
        .unwrap();

    let hit = graph.get_cached(&base.id, &config).unwrap().unwrap();
    assert_eq!(hit.id, cached.id);

    let miss = RunConfig {
        cmd: vec!["lint".to_string()],
        ..Default::default()
    };
    assert!(graph.get_cached(&base.id, &miss).unwrap().is_none());
}

#[test]
fn test_tar_layer_round_trips_content() {
    let temp = TempDir::new().unwrap();
    let graph = open(temp.path());
    let img = graph
        .create(Some(layer("a.txt", b"payload")), "", "", "", "", None, None)
        .unwrap();

    let mut copy = Image::new(generate_id(), "");
    graph.register(&mut copy, Some(graph.tar_layer(&img).unwrap())).unwrap();

    let driver = graph.driver();
    let dir = driver.get(&copy.id, "").unwrap();
    assert_eq!(fs::read(dir.join("a.txt")).unwrap(), b"payload");
    driver.put(&copy.id).unwrap();
}
