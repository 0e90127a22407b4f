//! The checksum engine: memoized digest computation over the record trie.
//!
//! The public entry resolves symlinks in an outer loop; each hop runs
//! `checksum_no_follow`, which serves cached digests from a shared-lock fast
//! path and escalates to the exclusive lock for everything else. Under the
//! exclusive lock a pending change journal commits first, then the digest is
//! computed recursively: directories compose their children's digests in
//! trie key order, leaves digest the real filesystem entry under the mount.
//! Completed digests are staged in a transaction and committed together; a
//! failed computation leaves no partial records behind.

use std::fs;
use std::sync::Arc;
use std::thread;

use sha2::{Digest as _, Sha256};

use crate::cancel::CancellationToken;
use crate::context::{CacheContext, State, Tree, TreeTxn};
use crate::error::{CacheError, Result};
use crate::filehash::file_digest;
use crate::mount::{Mount, Mountable};
use crate::path::{is_abs, join, normalize, parent, split_key, to_key, to_path};
use crate::record::{CacheRecord, Digest};
use crate::scan::{needs_scan, scan_path};
use crate::MAX_SYMLINK_HOPS;

impl CacheContext {
    /// Computes the memoized digest of `p` inside `mountable`.
    ///
    /// Follows symlink records until a non-symlink resolves, with a 255-hop
    /// limit. The mount is acquired lazily and released on every exit path.
    pub fn checksum(
        self: &Arc<Self>,
        mountable: &dyn Mountable,
        p: &str,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        let mut mount = Mount::new(mountable, self.mounter.as_ref());
        let mut p = normalize(p);
        let mut hops = 0u32;
        loop {
            if hops > MAX_SYMLINK_HOPS {
                return Err(CacheError::TooManySymlinks { path: p });
            }
            cancel.check()?;
            match self.checksum_no_follow(&mut mount, &p, cancel)? {
                CacheRecord::Symlink { linkname, .. } => {
                    p = if is_abs(&linkname) {
                        normalize(&linkname)
                    } else {
                        join(&parent(&p), &linkname)
                    };
                    hops += 1;
                }
                record => return Ok(record.digest().clone()),
            }
        }
    }

    fn checksum_no_follow(
        self: &Arc<Self>,
        mount: &mut Mount<'_>,
        p: &str,
        cancel: &CancellationToken,
    ) -> Result<CacheRecord> {
        let k = to_key(p);

        {
            let st = self.state.read();
            if st.journal.is_none() {
                let tree = st.tree.clone();
                drop(st);
                if let Some(record) = tree.get(&k) {
                    if !record.digest().is_empty() {
                        return Ok(record.clone());
                    }
                }
            }
        }

        // Lock upgrade is drop-then-reacquire; re-check the journal now that
        // another writer may have run.
        let mut st = self.state.write();
        if st.journal.is_some() {
            st.commit_journal();
        }

        let result = self.lazy_checksum(&mut st, mount, p, cancel);

        if st.dirty {
            st.dirty = false;
            let cc = Arc::clone(self);
            thread::spawn(move || {
                if let Err(err) = cc.save() {
                    tracing::warn!(
                        target = "strata.contenthash",
                        layer = cc.id(),
                        error = %err,
                        "background cache persistence failed"
                    );
                }
            });
        }

        result
    }

    fn lazy_checksum(
        &self,
        st: &mut State,
        mount: &mut Mount<'_>,
        p: &str,
        cancel: &CancellationToken,
    ) -> Result<CacheRecord> {
        if needs_scan(&st.tree, p)? {
            scan_path(st, mount, p, cancel)?;
        }

        let k = to_key(p);
        let snapshot = st.tree.clone();
        let mut txn = snapshot.txn();
        let mut updated = false;
        let record = self.checksum_key(&snapshot, &mut txn, mount, &k, cancel, &mut updated)?;
        st.tree = txn.commit();
        st.dirty = updated;
        Ok(record)
    }

    /// Recursive digest computation for one key, memoizing into `txn`.
    ///
    /// Reads go through the pre-transaction snapshot: records computed during
    /// this pass are returned up the recursion, not re-read.
    fn checksum_key(
        &self,
        snapshot: &Tree,
        txn: &mut TreeTxn,
        mount: &mut Mount<'_>,
        k: &[u8],
        cancel: &CancellationToken,
        updated: &mut bool,
    ) -> Result<CacheRecord> {
        cancel.check()?;

        let (k, record) = get_follow_links(snapshot, k)?
            .ok_or_else(|| CacheError::NotFound { path: to_path(k) })?;
        if !record.digest().is_empty() {
            return Ok(record);
        }

        let digest = if record.is_dir() {
            let mut hasher = Sha256::new();
            let mut child_prefix = k.clone();
            child_prefix.push(0);

            // Children start strictly after the header key and share its
            // prefix. A child directory contributes its recursive digest and
            // its own subtree is skipped by re-seeking past it.
            let mut cursor = snapshot.range_after(&child_prefix);
            while let Some((subk, _)) = cursor.next() {
                if !subk.starts_with(&child_prefix) {
                    break;
                }
                hasher.update(&subk[k.len()..]);
                let sub = self.checksum_key(snapshot, txn, mount, subk, cancel, updated)?;
                hasher.update(sub.digest().as_str().as_bytes());
                if sub.is_dir() {
                    let mut skip = subk.to_vec();
                    skip.push(0);
                    skip.push(0xff);
                    cursor = snapshot.range_after(&skip);
                }
            }
            Digest::from_sha256(hasher)
        } else {
            let trimmed = match k.split_last() {
                Some((&0, head)) => head,
                _ => k.as_slice(),
            };
            let rel = to_path(trimmed);

            let mount_root = mount.mount_path(cancel)?;
            let entry_path = if rel.is_empty() {
                mount_root.to_path_buf()
            } else {
                mount_root.join(&rel[1..])
            };

            let meta = fs::symlink_metadata(&entry_path)?;
            cancel.check()?;
            file_digest(&entry_path, &meta)?
        };

        let computed = record.with_digest(digest);
        txn.insert(k, computed.clone());
        *updated = true;
        Ok(computed)
    }
}

/// Resolves `k` through symlink records in key space.
///
/// A miss walks up to the nearest present ancestor; if that ancestor is a
/// symlink its target is substituted as the new key prefix and the lookup
/// retries, so a path through a link resolves without touching the OS.
/// Returns the canonical key and record, or `None` if nothing resolves.
pub(crate) fn get_follow_links(
    snapshot: &Tree,
    k: &[u8],
) -> Result<Option<(Vec<u8>, CacheRecord)>> {
    let mut hops = 0u32;
    get_follow_links_walk(snapshot, k, &mut hops)
}

fn get_follow_links_walk(
    snapshot: &Tree,
    k: &[u8],
    hops: &mut u32,
) -> Result<Option<(Vec<u8>, CacheRecord)>> {
    if let Some(record) = snapshot.get(k) {
        return Ok(Some((k.to_vec(), record.clone())));
    }
    if k.is_empty() {
        return Ok(None);
    }

    let (dir, file) = split_key(k);
    let resolved = get_follow_links_walk(snapshot, &dir, hops)?;
    if let Some((_, CacheRecord::Symlink { linkname, .. })) = resolved {
        *hops += 1;
        if *hops > MAX_SYMLINK_HOPS {
            return Err(CacheError::TooManySymlinks { path: to_path(k) });
        }
        let dir_path = to_path(&dir);
        let link = if is_abs(&linkname) {
            normalize(&linkname)
        } else {
            join(&parent(&dir_path), &linkname)
        };
        let mut new_key = to_key(&link);
        new_key.extend_from_slice(&file);
        return get_follow_links_walk(snapshot, &new_key, hops);
    }

    Ok(None)
}
