//! Lazy subtree scan: populates stub records for everything under a path's
//! parent directory.
//!
//! Scans are additive: entries already present in the pre-scan snapshot are
//! left alone, because change notifications are authoritative for removals
//! and modifications. Symlinks traversed while resolving the parent
//! directory are materialized as records too, so the checksum engine can
//! later resolve them logically without another walk.

use std::io;

use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::context::{State, Tree};
use crate::error::{CacheError, Result};
use crate::mount::Mount;
use crate::path::{is_abs, join, normalize, parent, to_key};
use crate::record::{CacheRecord, Digest};
use crate::resolve::root_path;
use crate::MAX_SYMLINK_HOPS;

/// Whether a checksum of `p` must scan first.
///
/// Walks the parent chain upward; a missing ancestor that bottoms out at a
/// missing root means nothing under the path has been observed yet. Symlink
/// ancestors are followed through the trie, with the usual hop limit.
pub(crate) fn needs_scan(tree: &Tree, p: &str) -> Result<bool> {
    let mut hops = 0u32;
    needs_scan_follow(tree, p, &mut hops)
}

fn needs_scan_follow(tree: &Tree, p: &str, hops: &mut u32) -> Result<bool> {
    match tree.get(&to_key(p)) {
        None => {
            if p.is_empty() {
                return Ok(true);
            }
            needs_scan_follow(tree, &parent(p), hops)
        }
        Some(CacheRecord::Symlink { linkname, .. }) => {
            if *hops > MAX_SYMLINK_HOPS {
                return Err(CacheError::TooManySymlinks { path: p.to_string() });
            }
            *hops += 1;
            let link = if is_abs(linkname) {
                normalize(linkname)
            } else {
                join(&parent(p), linkname)
            };
            needs_scan_follow(tree, &link, hops)
        }
        Some(_) => Ok(false),
    }
}

/// Scans the subtree rooted at `p`'s parent directory, staging stub records
/// for every entry not yet in the trie, and commits.
pub(crate) fn scan_path(
    st: &mut State,
    mount: &mut Mount<'_>,
    p: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let parent_dir = parent(p);
    let mount_root = mount.mount_path(cancel)?.to_path_buf();

    let base = st.tree.clone();
    let mut txn = st.tree.txn();

    let scan_root = root_path(&mount_root, &parent_dir, &mut |link_path, target| {
        txn.insert(
            to_key(&normalize(link_path)),
            CacheRecord::Symlink {
                digest: Digest::default(),
                linkname: target.to_string(),
            },
        );
        Ok(())
    })?;

    for entry in WalkDir::new(&scan_root) {
        cancel.check()?;
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(&mount_root).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("walked outside the mount root: {}", entry.path().display()),
            )
        })?;
        let entry_path = normalize(&format!("/{}", rel.to_string_lossy()));
        let k = to_key(&entry_path);
        if base.get(&k).is_some() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            txn.insert(
                k,
                CacheRecord::Symlink {
                    digest: Digest::default(),
                    linkname: target.to_string_lossy().into_owned(),
                },
            );
        } else if file_type.is_dir() {
            txn.insert(k.clone(), CacheRecord::dir_stub());
            let mut header_key = k;
            header_key.push(0);
            txn.insert(
                header_key,
                CacheRecord::DirHeader {
                    digest: Digest::default(),
                },
            );
        } else {
            txn.insert(
                k,
                CacheRecord::File {
                    digest: Digest::default(),
                },
            );
        }
    }

    st.tree = txn.commit();
    Ok(())
}
