use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use panfs::remote::RemoteClient;
use panfs::state::download::{DownloadConfig, DownloadCoordinator, TaskState};
use panfs::state::entities::ROOT_INO;

use crate::helpers::{random_bytes, remote_record, Call, MockRemote};

const CHUNK: usize = 1024;

fn coordinator(remote: &Arc<MockRemote>, shadow: &std::path::Path, block_size: u64) -> DownloadCoordinator {
    DownloadCoordinator::new(
        shadow.to_path_buf(),
        remote.clone() as Arc<dyn RemoteClient>,
        DownloadConfig {
            block_size,
            chunk_size: CHUNK,
            wait_timeout: Duration::from_secs(5),
            link_ttl: Duration::from_secs(3600),
        },
    )
}

#[test]
fn test_read_fetches_one_window_and_serves_bytes() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(10 * CHUNK);
    remote.add_file("/big.bin", &data);
    let record = remote_record(&remote, "/big.bin", ROOT_INO);
    remote.clear_calls();
    let dl = coordinator(&remote, shadow.path(), 4096);

    let got = dl.read(&record, 0, Some(100));

    assert_eq!(got, &data[..100]);
    assert_eq!(
        remote.fetches(),
        vec![Call::Fetch { fs_id: record.ino(), start: 0, end: Some(4096) }]
    );
    assert_eq!(std::fs::metadata(shadow.path().join("big.bin")).unwrap().len(), 4096);
    assert_eq!(dl.active_tasks(), 0);
}

#[test]
fn test_covered_window_makes_no_network_call() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(8 * CHUNK);
    remote.add_file("/f", &data);
    let record = remote_record(&remote, "/f", ROOT_INO);
    let dl = coordinator(&remote, shadow.path(), 4096);

    dl.read(&record, 0, Some(10));
    remote.clear_calls();

    let got = dl.read(&record, 1000, Some(2000));
    assert_eq!(got, &data[1000..3000]);
    assert!(remote.calls().is_empty(), "unexpected calls: {:?}", remote.calls());
}

#[test]
fn test_gap_fill_starts_at_shadow_end() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(40 * CHUNK);
    remote.add_file("/f", &data);
    let record = remote_record(&remote, "/f", ROOT_INO);
    let dl = coordinator(&remote, shadow.path(), 2048);

    dl.read(&record, 0, Some(10));
    remote.clear_calls();

    let offset = 30 * CHUNK as u64;
    let got = dl.read(&record, offset, Some(100));

    assert_eq!(got, &data[offset as usize..offset as usize + 100]);
    let fetches = remote.fetches();
    assert!(!fetches.is_empty());
    assert!(matches!(fetches[0], Call::Fetch { start: 2048, .. }), "{:?}", fetches);
    let len = std::fs::metadata(shadow.path().join("f")).unwrap().len();
    assert!(len >= offset + 100);
    // The shadow file is a byte-faithful prefix of the object.
    let mirror = std::fs::read(shadow.path().join("f")).unwrap();
    assert_eq!(&mirror[..], &data[..mirror.len()]);
}

#[test]
fn test_read_to_end_sends_open_range() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(3 * CHUNK + 17);
    remote.add_file("/tail", &data);
    let record = remote_record(&remote, "/tail", ROOT_INO);
    remote.clear_calls();
    let dl = coordinator(&remote, shadow.path(), 1024);

    let got = dl.read(&record, 0, None);

    assert_eq!(got, data);
    assert_eq!(
        remote.fetches(),
        vec![Call::Fetch { fs_id: record.ino(), start: 0, end: None }]
    );
}

#[test]
fn test_fetch_failure_returns_what_is_cached() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(8 * CHUNK);
    remote.add_file("/f", &data);
    let record = remote_record(&remote, "/f", ROOT_INO);
    let dl = coordinator(&remote, shadow.path(), 1024);

    dl.read(&record, 0, Some(1024));
    remote.fail_fetch.store(true, Ordering::Relaxed);

    let got = dl.read(&record, 512, Some(4096));
    assert_eq!(got, &data[512..1024]);

    let nothing = dl.read(&record, 6000, Some(10));
    assert!(nothing.is_empty());
    assert_eq!(dl.active_tasks(), 0);
}

#[test]
fn test_read_past_end_is_empty() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.add_file("/f", b"hello");
    let record = remote_record(&remote, "/f", ROOT_INO);
    remote.clear_calls();
    let dl = coordinator(&remote, shadow.path(), 1024);

    assert!(dl.read(&record, 5, Some(10)).is_empty());
    assert!(remote.calls().is_empty());
}

#[test]
fn test_concurrent_reads_share_one_fetch() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(8 * CHUNK);
    remote.add_file("/shared", &data);
    let record = remote_record(&remote, "/shared", ROOT_INO);
    remote.clear_calls();
    let dl = Arc::new(coordinator(&remote, shadow.path(), 8 * CHUNK as u64));
    let gate = remote.gate_fetch_at(2 * CHUNK as u64);

    let first = {
        let dl = Arc::clone(&dl);
        let record = record.clone();
        std::thread::spawn(move || dl.read(&record, 0, Some(8 * CHUNK as u64)))
    };
    assert!(gate.wait_reached(Duration::from_secs(5)));

    let second = {
        let dl = Arc::clone(&dl);
        let record = record.clone();
        std::thread::spawn(move || dl.read(&record, 4 * CHUNK as u64, Some(CHUNK as u64)))
    };
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(dl.active_tasks(), 1);
    assert_eq!(remote.fetches().len(), 1);

    gate.release();
    let a = first.join().unwrap();
    let b = second.join().unwrap();

    assert_eq!(a, data);
    assert_eq!(b, &data[4 * CHUNK..5 * CHUNK]);
    assert_eq!(remote.fetches().len(), 1);
    assert_eq!(dl.active_tasks(), 0);
}

#[test]
fn test_cancel_stops_at_chunk_boundary() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(5 * CHUNK);
    remote.add_file("/movie", &data);
    let record = remote_record(&remote, "/movie", ROOT_INO);
    let dl = Arc::new(coordinator(&remote, shadow.path(), 5 * CHUNK as u64));
    let gate = remote.gate_fetch_at(2 * CHUNK as u64);

    let reader = {
        let dl = Arc::clone(&dl);
        let record = record.clone();
        std::thread::spawn(move || dl.read(&record, 0, Some(5 * CHUNK as u64)))
    };
    assert!(gate.wait_reached(Duration::from_secs(5)));
    let task = dl.task(record.ino()).expect("task should be running");
    assert_eq!(task.state(), TaskState::Running);

    assert!(dl.cancel(record.ino()));
    assert_eq!(task.state(), TaskState::Cancelled);
    gate.release();
    let got = reader.join().unwrap();

    let mirror = std::fs::read(shadow.path().join("movie")).unwrap();
    assert_eq!(mirror.len(), 2 * CHUNK);
    assert_eq!(&mirror[..], &data[..2 * CHUNK]);
    assert_eq!(got, &data[..2 * CHUNK]);
    assert!(dl.task(record.ino()).is_none());
}

#[test]
fn test_stale_shadow_is_discarded() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(2 * CHUNK);
    remote.add_file("/f", &data);
    std::fs::write(shadow.path().join("f"), random_bytes(3 * CHUNK)).unwrap();
    let record = remote_record(&remote, "/f", ROOT_INO);
    let dl = coordinator(&remote, shadow.path(), 1024);

    let got = dl.read(&record, 0, Some(2 * CHUNK as u64));
    assert_eq!(got, data);
}

#[test]
fn test_newer_remote_object_invalidates_shadow() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let old = random_bytes(CHUNK);
    remote.add_file("/f", &old);
    let dl = coordinator(&remote, shadow.path(), 1024);
    let record = remote_record(&remote, "/f", ROOT_INO);
    assert_eq!(dl.read(&record, 0, Some(CHUNK as u64)), old);

    let new = random_bytes(CHUNK);
    remote.add_file_with_id("/f", record.ino(), &new);
    let future = chrono::Utc::now().timestamp() + 3600;
    remote.set_mtime("/f", future);
    let record = remote_record(&remote, "/f", ROOT_INO);

    assert_eq!(dl.read(&record, 0, Some(CHUNK as u64)), new);
}

#[test]
fn test_fetch_all_completes_shadow() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    let data = random_bytes(7 * CHUNK + 3);
    remote.add_file("/dir/f", &data);
    remote.add_dir("/dir");
    let record = remote_record(&remote, "/dir/f", 99);
    let dl = coordinator(&remote, shadow.path(), 2048);

    assert!(dl.fetch_all(&record));
    assert_eq!(std::fs::read(shadow.path().join("dir/f")).unwrap(), data);
}

#[test]
fn test_download_links_are_cached_and_evictable() {
    let shadow = tempfile::tempdir().unwrap();
    let remote = MockRemote::new();
    remote.add_file("/f", &random_bytes(4 * CHUNK));
    let record = remote_record(&remote, "/f", ROOT_INO);
    let dl = DownloadCoordinator::new(
        shadow.path().to_path_buf(),
        remote.clone() as Arc<dyn RemoteClient>,
        DownloadConfig {
            block_size: 1024,
            chunk_size: CHUNK,
            wait_timeout: Duration::from_secs(5),
            link_ttl: Duration::from_millis(50),
        },
    );

    dl.read(&record, 0, Some(10));
    dl.read(&record, 2048, Some(10));
    assert_eq!(remote.count(|c| matches!(c, Call::Meta(_))), 1);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(dl.evict_stale_links(), 1);
    dl.read(&record, 3500, Some(10));
    assert_eq!(remote.count(|c| matches!(c, Call::Meta(_))), 2);
}
