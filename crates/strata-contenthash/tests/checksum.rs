mod support;

use std::fs;
use std::os::unix::fs::symlink;

use pretty_assertions::assert_eq;
use sha2::{Digest as _, Sha256};
use strata_contenthash::{
    CacheError, CacheManager, CancellationToken, Digest, MemoryMetadataStore,
};

use support::{entry_digest, TestLayer};

#[test]
fn file_checksum_matches_the_primitive_and_caches() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("hello.txt"), "hi").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("s1", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let digest = manager.checksum(&layer, "/hello.txt", &cancel).unwrap();
    assert_eq!(digest, entry_digest(&tmp.path().join("hello.txt")));
    assert_eq!(layer.mount_count(), 1);

    // Served from the cache: no second mount, no second read.
    let again = manager.checksum(&layer, "/hello.txt", &cancel).unwrap();
    assert_eq!(again, digest);
    assert_eq!(layer.mount_count(), 1);
}

#[test]
fn directory_digest_composes_children_in_key_order() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/a.txt"), "aaa").unwrap();
    fs::write(tmp.path().join("d/b.txt"), "bbb").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("s2", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let dir = manager.checksum(&layer, "/d", &cancel).unwrap();

    let da = entry_digest(&tmp.path().join("d/a.txt"));
    let db = entry_digest(&tmp.path().join("d/b.txt"));
    let mut hasher = Sha256::new();
    hasher.update(b"\x00a.txt");
    hasher.update(da.as_str().as_bytes());
    hasher.update(b"\x00b.txt");
    hasher.update(db.as_str().as_bytes());
    assert_eq!(dir, Digest::from_sha256(hasher));
}

#[test]
fn nested_directories_contribute_their_recursive_digest() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("d/sub")).unwrap();
    fs::write(tmp.path().join("d/a.txt"), "aaa").unwrap();
    fs::write(tmp.path().join("d/sub/inner.txt"), "inner").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("nested", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let dir = manager.checksum(&layer, "/d", &cancel).unwrap();
    let sub = manager.checksum(&layer, "/d/sub", &cancel).unwrap();

    let mut expect_sub = Sha256::new();
    expect_sub.update(b"\x00inner.txt");
    expect_sub.update(
        entry_digest(&tmp.path().join("d/sub/inner.txt"))
            .as_str()
            .as_bytes(),
    );
    assert_eq!(sub, Digest::from_sha256(expect_sub));

    let mut expect_dir = Sha256::new();
    expect_dir.update(b"\x00a.txt");
    expect_dir.update(
        entry_digest(&tmp.path().join("d/a.txt"))
            .as_str()
            .as_bytes(),
    );
    expect_dir.update(b"\x00sub");
    expect_dir.update(sub.as_str().as_bytes());
    assert_eq!(dir, Digest::from_sha256(expect_dir));
}

#[test]
fn symlinked_paths_resolve_to_the_target_digest() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/a.txt"), "aaa").unwrap();
    symlink("/d", tmp.path().join("link")).unwrap();
    symlink("d", tmp.path().join("rel")).unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("s4", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let through_link = manager.checksum(&layer, "/link/a.txt", &cancel).unwrap();
    let direct = manager.checksum(&layer, "/d/a.txt", &cancel).unwrap();
    assert_eq!(through_link, direct);

    let through_rel = manager.checksum(&layer, "/rel/a.txt", &cancel).unwrap();
    assert_eq!(through_rel, direct);
}

#[test]
fn symlink_cycles_exhaust_the_hop_limit() {
    let tmp = tempfile::tempdir().unwrap();
    symlink("/loop", tmp.path().join("loop")).unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("s5", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let err = manager.checksum(&layer, "/loop", &cancel).unwrap_err();
    assert!(matches!(err, CacheError::TooManySymlinks { .. }));
}

#[test]
fn missing_paths_are_not_found_after_a_scan() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("present.txt"), "x").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("missing", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let err = manager.checksum(&layer, "/absent.txt", &cancel).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn digests_are_deterministic_across_contexts() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/a.txt"), "aaa").unwrap();

    let cancel = CancellationToken::new();
    let mut digests = Vec::new();
    for run in 0..2 {
        let store = MemoryMetadataStore::new();
        let layer = TestLayer::new(&format!("det-{run}"), tmp.path(), &store);
        let manager = CacheManager::new();
        digests.push(manager.checksum(&layer, "/d", &cancel).unwrap());
    }
    assert_eq!(digests[0], digests[1]);
}

#[test]
fn scans_are_lazy_and_additive() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::write(tmp.path().join("d/a.txt"), "aaa").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("lazy", tmp.path(), &store);
    let manager = CacheManager::new();
    let cancel = CancellationToken::new();

    let before = manager.checksum(&layer, "/d", &cancel).unwrap();

    // Without a change notification, new on-disk entries are invisible: the
    // cached digest stands and nothing is re-walked.
    fs::write(tmp.path().join("d/later.txt"), "late").unwrap();
    let after = manager.checksum(&layer, "/d", &cancel).unwrap();
    assert_eq!(before, after);
    assert_eq!(layer.mount_count(), 1);
}

#[test]
fn cancelled_tokens_abort_the_call() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("f"), "x").unwrap();

    let store = MemoryMetadataStore::new();
    let layer = TestLayer::new("cancelled", tmp.path(), &store);
    let manager = CacheManager::new();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = manager.checksum(&layer, "/f", &cancel).unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
    assert_eq!(layer.mount_count(), 0);
}
