#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_contenthash::{
    file_digest, CancellationToken, ChangeStat, Digest, Layer, MemoryMetadataStore,
    MemoryStorageItem, MountEntry, Mountable, Result, StorageItem,
};

/// A layer backed by a plain directory, surfaced as a bind mount.
///
/// Counts mount requests so tests can observe whether a checksum had to
/// touch the filesystem at all.
pub struct TestLayer {
    root: PathBuf,
    md: Arc<MemoryStorageItem>,
    mounts: AtomicUsize,
}

impl TestLayer {
    pub fn new(id: &str, root: impl Into<PathBuf>, store: &Arc<MemoryMetadataStore>) -> Self {
        Self {
            root: root.into(),
            md: store.item(id),
            mounts: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }
}

impl Mountable for TestLayer {
    fn mount(&self, _readonly: bool, _cancel: &CancellationToken) -> Result<Vec<MountEntry>> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(vec![MountEntry {
            kind: "bind".into(),
            source: self.root.clone(),
            options: vec!["ro".into()],
        }])
    }
}

impl Layer for TestLayer {
    fn metadata(&self) -> Arc<dyn StorageItem> {
        self.md.clone()
    }
}

/// Digest of a single on-disk entry, as the file-hash primitive computes it.
pub fn entry_digest(path: &Path) -> Digest {
    let meta = fs::symlink_metadata(path).expect("test entry exists");
    file_digest(path, &meta).expect("test entry digests")
}

pub fn file_stat(digest: Digest) -> ChangeStat {
    ChangeStat {
        mode: 0o100644,
        size: 0,
        uid: 0,
        gid: 0,
        mtime: 0,
        linkname: String::new(),
        digest,
    }
}

pub fn symlink_stat(target: &str, digest: Digest) -> ChangeStat {
    ChangeStat {
        mode: 0o120777,
        size: 0,
        uid: 0,
        gid: 0,
        mtime: 0,
        linkname: target.to_string(),
        digest,
    }
}

pub fn dir_stat(digest: Digest) -> ChangeStat {
    ChangeStat {
        mode: 0o040755,
        size: 0,
        uid: 0,
        gid: 0,
        mtime: 0,
        linkname: String::new(),
        digest,
    }
}
