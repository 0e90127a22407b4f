//! The single-entity file-hash primitive.
//!
//! Digests one filesystem entry: a normalized stat header (mode, size for
//! regular files, uid/gid, mtime, symlink target) followed by the content of
//! regular files. Change-feed producers use the same function to precompute
//! the digests they attach to notifications, so journal-provided digests and
//! scan-computed digests agree.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::error::Result;
use crate::record::Digest;

/// Digests the entry at `path` described by `meta` (from `symlink_metadata`).
pub fn file_digest(path: &Path, meta: &fs::Metadata) -> Result<Digest> {
    let mut hasher = Sha256::new();

    let file_type = meta.file_type();
    let size = if file_type.is_file() { meta.size() } else { 0 };

    hasher.update(meta.mode().to_le_bytes());
    hasher.update(size.to_le_bytes());
    hasher.update(meta.uid().to_le_bytes());
    hasher.update(meta.gid().to_le_bytes());
    hasher.update(meta.mtime().to_le_bytes());
    hasher.update(meta.mtime_nsec().to_le_bytes());

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        hasher.update(target.to_string_lossy().as_bytes());
    }

    if file_type.is_file() && size > 0 {
        let mut file = fs::File::open(path)?;
        io::copy(&mut file, &mut hasher)?;
    }

    Ok(Digest::from_sha256(hasher))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_changes_the_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");

        fs::write(&path, "one").unwrap();
        let first = file_digest(&path, &fs::symlink_metadata(&path).unwrap()).unwrap();

        fs::write(&path, "two").unwrap();
        let second = file_digest(&path, &fs::symlink_metadata(&path).unwrap()).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn symlink_digest_covers_the_target() {
        let tmp = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("a", tmp.path().join("l1")).unwrap();
        std::os::unix::fs::symlink("b", tmp.path().join("l2")).unwrap();

        let d1 = file_digest(
            &tmp.path().join("l1"),
            &fs::symlink_metadata(tmp.path().join("l1")).unwrap(),
        )
        .unwrap();
        let d2 = file_digest(
            &tmp.path().join("l2"),
            &fs::symlink_metadata(tmp.path().join("l2")).unwrap(),
        )
        .unwrap();
        assert_ne!(d1, d2);
    }
}
