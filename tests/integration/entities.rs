use std::sync::Arc;

use panfs::remote::RemoteEntry;
use panfs::state::entities::{EntityDirectory, FileRecord, Identity, LOCAL_INODE_BASE, ROOT_INO};

fn entry(fs_id: u64, path: &str, isdir: bool, size: u64) -> RemoteEntry {
    RemoteEntry {
        fs_id,
        path: path.to_string(),
        filename: path.rsplit('/').next().unwrap().to_string(),
        isdir,
        size,
        server_mtime: 1_600_000_000,
        ..Default::default()
    }
}

fn record(fs_id: u64, parent: u64, path: &str) -> FileRecord {
    FileRecord::from_remote(parent, &entry(fs_id, path, false, 10))
}

#[test]
fn test_upsert_visible_in_all_indices() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a.txt"));

    let by_id = dir.get_by_id(10).unwrap();
    let by_name = dir.get_by_parent_name(ROOT_INO, "a.txt").unwrap();
    assert!(Arc::ptr_eq(&by_id, &by_name));
    assert_eq!(by_id.path, "/a.txt");
    assert_eq!(dir.children_of(ROOT_INO).len(), 1);
}

#[test]
fn test_remove_clears_every_index() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a.txt"));
    dir.upsert(record(11, ROOT_INO, "/b.txt"));

    let removed = dir.remove(10).unwrap();
    assert_eq!(removed.name, "a.txt");
    assert!(dir.get_by_id(10).is_none());
    assert!(dir.get_by_parent_name(ROOT_INO, "a.txt").is_none());
    let names: Vec<_> = dir.children_of(ROOT_INO).iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec!["b.txt"]);
    assert!(dir.remove(10).is_none());
}

#[test]
fn test_upsert_same_id_new_name_moves_record() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a.txt"));
    dir.upsert(record(10, ROOT_INO, "/renamed.txt"));

    assert!(dir.get_by_parent_name(ROOT_INO, "a.txt").is_none());
    assert_eq!(dir.get_by_parent_name(ROOT_INO, "renamed.txt").unwrap().ino(), 10);
    assert_eq!(dir.children_of(ROOT_INO).len(), 1);
    assert_eq!(dir.len(), 1);
}

#[test]
fn test_upsert_different_id_same_name_supersedes() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a.txt"));
    dir.upsert(record(20, ROOT_INO, "/a.txt"));

    assert!(dir.get_by_id(10).is_none());
    assert_eq!(dir.get_by_parent_name(ROOT_INO, "a.txt").unwrap().ino(), 20);
    assert_eq!(dir.children_of(ROOT_INO).len(), 1);
}

#[test]
fn test_replace_children_drops_stale_and_keeps_order() {
    let dir = EntityDirectory::new();
    dir.replace_children(
        ROOT_INO,
        vec![record(1_001, ROOT_INO, "/x"), record(1_002, ROOT_INO, "/y")],
    );
    let listed = dir.replace_children(
        ROOT_INO,
        vec![record(1_003, ROOT_INO, "/z"), record(1_002, ROOT_INO, "/y")],
    );

    let names: Vec<_> = listed.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["z", "y"]);
    assert!(dir.get_by_id(1_001).is_none());
    assert!(dir.get_by_parent_name(ROOT_INO, "x").is_none());
}

#[test]
fn test_replace_children_keeps_local_entries() {
    let dir = EntityDirectory::new();
    let id = dir.alloc_local();
    assert!(id.ino() >= LOCAL_INODE_BASE);
    dir.upsert(FileRecord::local(id.ino(), ROOT_INO, "/.a.swp".into(), ".a.swp".into()));

    let listed = dir.replace_children(ROOT_INO, vec![record(5, ROOT_INO, "/a")]);
    let names: Vec<_> = listed.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", ".a.swp"]);
    assert!(dir.get_by_id(id.ino()).unwrap().identity.is_local());
}

#[test]
fn test_rekey_is_atomic_and_preserves_fields() {
    let dir = EntityDirectory::new();
    let local = dir.alloc_local();
    let mut rec = FileRecord::local(local.ino(), ROOT_INO, "/draft".into(), "draft".into());
    rec.size = 42;
    dir.upsert(rec);

    let new = dir.rekey(local.ino(), Identity::Remote(777)).unwrap();
    assert_eq!(new.identity, Identity::Remote(777));
    assert_eq!(new.size, 42);
    assert!(dir.get_by_id(local.ino()).is_none());
    assert_eq!(dir.get_by_parent_name(ROOT_INO, "draft").unwrap().ino(), 777);
    let kids = dir.children_of(ROOT_INO);
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0].ino(), 777);
}

#[test]
fn test_children_snapshot_survives_clear() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a"));
    dir.upsert(record(11, ROOT_INO, "/b"));
    let snapshot = dir.children_of(ROOT_INO);

    dir.clear();
    assert!(dir.is_empty());
    assert!(dir.children_of(ROOT_INO).is_empty());
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[1].name, "b");
}

#[test]
fn test_remove_directory_drops_child_list() {
    let dir = EntityDirectory::new();
    dir.upsert(FileRecord::from_remote(ROOT_INO, &entry(50, "/d", true, 0)));
    dir.upsert(record(51, 50, "/d/f"));
    assert!(dir.is_listed(50));

    dir.remove(50);
    assert!(!dir.is_listed(50));
}

#[test]
fn test_remove_directory_takes_descendants() {
    let dir = EntityDirectory::new();
    dir.upsert(FileRecord::from_remote(ROOT_INO, &entry(50, "/d", true, 0)));
    dir.upsert(FileRecord::from_remote(50, &entry(51, "/d/sub", true, 0)));
    dir.upsert(record(52, 50, "/d/f"));
    dir.upsert(record(53, 51, "/d/sub/g"));
    dir.upsert(record(60, ROOT_INO, "/other"));

    let removed: Vec<u64> = dir.remove_tree(50).iter().map(|r| r.ino()).collect();

    assert_eq!(removed[0], 50);
    assert_eq!(removed.len(), 4);
    for ino in [50, 51, 52, 53] {
        assert!(dir.get_by_id(ino).is_none(), "{} still indexed", ino);
    }
    assert!(dir.get_by_parent_name(50, "f").is_none());
    assert!(dir.get_by_parent_name(51, "g").is_none());
    assert!(!dir.is_listed(51));
    assert_eq!(dir.len(), 1);
}

#[test]
fn test_relocate_directory_rewrites_descendant_paths() {
    let dir = EntityDirectory::new();
    dir.upsert(FileRecord::from_remote(ROOT_INO, &entry(50, "/old", true, 0)));
    dir.upsert(FileRecord::from_remote(50, &entry(51, "/old/sub", true, 0)));
    dir.upsert(record(52, 50, "/old/f"));
    dir.upsert(record(53, 51, "/old/sub/g"));
    dir.upsert(record(54, ROOT_INO, "/older"));

    let moved = dir.relocate(50, ROOT_INO, "new", "/new");

    assert_eq!(moved.len(), 4);
    assert_eq!(dir.get_by_id(50).unwrap().path, "/new");
    assert!(dir.get_by_parent_name(ROOT_INO, "old").is_none());
    assert_eq!(dir.get_by_parent_name(ROOT_INO, "new").unwrap().ino(), 50);
    assert_eq!(dir.get_by_parent_name(50, "f").unwrap().path, "/new/f");
    assert_eq!(dir.get_by_id(53).unwrap().path, "/new/sub/g");
    assert_eq!(dir.children_of(51)[0].path, "/new/sub/g");
    assert_eq!(dir.get_by_id(54).unwrap().path, "/older");
}

#[test]
fn test_modify_updates_in_place() {
    let dir = EntityDirectory::new();
    dir.upsert(record(10, ROOT_INO, "/a"));
    dir.modify(10, |r| r.size = 999);
    assert_eq!(dir.get_by_id(10).unwrap().size, 999);
    assert_eq!(dir.get_by_parent_name(ROOT_INO, "a").unwrap().size, 999);
    assert!(dir.modify(12345, |r| r.size = 1).is_none());
}

#[test]
fn test_concurrent_upserts_stay_consistent() {
    let dir = Arc::new(EntityDirectory::new());
    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let dir = Arc::clone(&dir);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    let id = 10_000 + t * 1_000 + i;
                    dir.upsert(record(id, ROOT_INO, &format!("/f{}", id)));
                    if i % 3 == 0 {
                        dir.remove(id);
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    for rec in dir.children_of(ROOT_INO) {
        assert!(dir.get_by_id(rec.ino()).is_some());
        assert_eq!(dir.get_by_parent_name(ROOT_INO, &rec.name).unwrap().ino(), rec.ino());
    }
    assert_eq!(dir.len(), dir.children_of(ROOT_INO).len());
}
