//! Hasher and cache store working together on a real directory tree.

use std::collections::BTreeSet;
use std::path::Path;

use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

use datum_cache::hasher::digest_bytes;
use datum_cache::{CacheStore, Hashed, Hasher, StateTable};
use datum_core::LinkType;

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[test]
fn touched_file_is_rehashed_from_bytes() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("data.csv");
    std::fs::write(&file, b"a,b\n1,2\n").unwrap();

    let hasher = Hasher::new(StateTable::load_at(tmp.path()).unwrap());
    let meta = std::fs::metadata(&file).unwrap();
    hasher
        .state()
        .record(&file, &meta, &datum_core::ContentId::from("stale"));

    set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();
    assert_eq!(hasher.hash_file(&file).unwrap(), digest_bytes(b"a,b\n1,2\n"));
}

#[test]
fn state_table_persists_between_hashers() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("model.bin");
    std::fs::write(&file, b"weights").unwrap();

    let first = Hasher::new(StateTable::load_at(tmp.path()).unwrap());
    let id = first.hash_file(&file).unwrap();
    first.save().unwrap();

    let second = Hasher::new(StateTable::load_at(tmp.path()).unwrap());
    let meta = std::fs::metadata(&file).unwrap();
    assert_eq!(second.state().lookup(&file, &meta), Some(id));
}

#[test]
fn directory_store_and_checkout_round_trip() {
    let tmp = TempDir::new().unwrap();
    let ws = tmp.path().join("ws");
    write(&ws, "images/a.png", b"aaa");
    write(&ws, "images/nested/b.png", b"bbb");
    write(&ws, "images/nested/c.png", b"aaa");

    let hasher = Hasher::new(StateTable::load_at(tmp.path()).unwrap());
    let cache = CacheStore::at_repo(tmp.path(), vec![LinkType::Copy]);

    let Hashed::Dir(dir_id, obj) = hasher.hash(&ws.join("images")).unwrap() else {
        panic!("expected a directory");
    };
    for entry in obj.entries() {
        cache
            .store_file(&ws.join("images").join(&entry.relpath), &entry.checksum)
            .unwrap();
    }
    assert_eq!(cache.save_dir_object(&obj).unwrap(), dir_id);
    // Two identical files share one entry: 2 blobs + 1 directory object.
    assert_eq!(cache.list_ids().unwrap().len(), 3);
    assert_eq!(cache.stats().writes(), 3);

    std::fs::remove_dir_all(ws.join("images")).unwrap();
    let loaded = cache.load_dir_object(&dir_id).unwrap();
    for entry in loaded.entries() {
        cache
            .materialize(&entry.checksum, &ws.join("images").join(&entry.relpath))
            .unwrap();
    }
    assert_eq!(std::fs::read(ws.join("images/nested/b.png")).unwrap(), b"bbb");

    let fresh = Hasher::new(StateTable::empty(tmp.path().join("other.json")));
    assert_eq!(fresh.hash(&ws.join("images")).unwrap().into_id(), dir_id);

    let report = cache.collect_garbage(&BTreeSet::new()).unwrap();
    assert_eq!(report.removed.len(), 3);
}
