//! Per-layer cache context: trie state, change journal, persistence.
//!
//! A [`CacheContext`] owns one layer's record trie and the journal of
//! pending change notifications. All state sits behind a single read/write
//! lock: fast-path readers take it shared, every trie mutation, journal
//! commit or save takes it exclusive. Readers never observe a staged
//! transaction: the journal is committed before any write-path read, and
//! escalation from the shared fast path re-checks under the exclusive lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use strata_pathmap::{PathMap, Txn};

use crate::change::{ChangeKind, ChangeStat};
use crate::error::{CacheError, Result};
use crate::mount::LocalMounter;
use crate::path::{normalize, parent, to_key, to_path};
use crate::record::{
    decode_records, encode_records, CacheRecord, Digest, PersistedRecord, PersistedRecords,
};
use crate::store::{StorageItem, CONTENT_HASH_KEY};

pub(crate) type Tree = PathMap<CacheRecord>;
pub(crate) type TreeTxn = Txn<CacheRecord>;

/// In-memory cache of one layer's records plus its pending change journal.
pub struct CacheContext {
    md: Arc<dyn StorageItem>,
    pub(crate) mounter: Arc<dyn LocalMounter>,
    pub(crate) state: RwLock<State>,
}

pub(crate) struct State {
    pub(crate) tree: Tree,
    /// Set when a checksum insertion made the in-memory state newer than the
    /// persisted blob; cleared when a save is handed off.
    pub(crate) dirty: bool,
    pub(crate) journal: Option<Journal>,
}

/// The staged change-journal transaction.
pub(crate) struct Journal {
    pub(crate) txn: TreeTxn,
    /// Snapshot the journal was opened from; subtree walks during deletes
    /// consult this, not the staged view.
    pub(crate) base: Tree,
    /// Directories whose recursive digests are stale.
    pub(crate) dirty_paths: BTreeSet<String>,
}

impl CacheContext {
    /// Creates a context for `md`, loading any persisted records.
    ///
    /// A missing blob starts fresh; a corrupt blob is logged and also starts
    /// fresh; the cache is advisory.
    pub fn new(md: Arc<dyn StorageItem>, mounter: Arc<dyn LocalMounter>) -> Result<Arc<Self>> {
        let tree = load_tree(md.as_ref());
        Ok(Arc::new(Self {
            md,
            mounter,
            state: RwLock::new(State {
                tree,
                dirty: false,
                journal: None,
            }),
        }))
    }

    /// Synthesizes a context over an existing trie snapshot, with a fresh
    /// journal. Used when re-parenting a context onto another layer.
    pub(crate) fn with_tree(
        md: Arc<dyn StorageItem>,
        mounter: Arc<dyn LocalMounter>,
        tree: Tree,
    ) -> Arc<Self> {
        Arc::new(Self {
            md,
            mounter,
            state: RwLock::new(State {
                tree,
                dirty: false,
                journal: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.md.id()
    }

    /// Whether in-memory state has diverged from the persisted blob.
    pub fn is_dirty(&self) -> bool {
        let st = self.state.read();
        st.dirty || st.journal.is_some()
    }

    pub(crate) fn snapshot(&self) -> Tree {
        self.state.read().tree.clone()
    }

    /// Commits any pending journal and writes the full record set back to
    /// the metadata store. Saves serialize on the context lock.
    pub fn save(&self) -> Result<()> {
        let mut st = self.state.write();
        st.commit_journal();

        let mut paths = Vec::with_capacity(st.tree.len());
        for (k, record) in st.tree.iter() {
            paths.push(PersistedRecord {
                path: to_path(k),
                record: record.clone(),
            });
        }
        let bytes = encode_records(&PersistedRecords { paths })?;
        self.md.set_external(CONTENT_HASH_KEY, &bytes)
    }

    /// Applies one change notification to the staged journal transaction.
    ///
    /// The journal does not open files: non-delete notifications must carry
    /// stat metadata and a precomputed entry digest. The transaction stays
    /// invisible to readers until the next read commits it.
    pub fn handle_change(
        &self,
        kind: ChangeKind,
        p: &str,
        stat: Option<&ChangeStat>,
    ) -> Result<()> {
        let p = normalize(p);
        let k = to_key(&p);

        let mut st = self.state.write();
        let State { tree, journal, .. } = &mut *st;
        let journal = journal.get_or_insert_with(|| {
            let mut txn = tree.txn();
            // The feed never reports the root; seed its records.
            if tree.get(&[0]).is_none() {
                txn.insert(
                    vec![0],
                    CacheRecord::DirHeader {
                        digest: Digest::from_bytes(b""),
                    },
                );
                txn.insert(Vec::new(), CacheRecord::dir_stub());
            }
            Journal {
                txn,
                base: tree.clone(),
                dirty_paths: BTreeSet::new(),
            }
        });

        if kind == ChangeKind::Delete {
            if let Some(CacheRecord::Dir { .. }) = journal.txn.delete(&k) {
                delete_subtree(journal, &k);
            }
            journal.dirty_paths.insert(parent(&p));
            return Ok(());
        }

        let stat = stat.ok_or_else(|| CacheError::InvalidChange { path: p.clone() })?;
        if stat.digest.is_empty() {
            return Err(CacheError::InvalidChange { path: p });
        }

        // A record changing away from a directory invalidates the subtree.
        if let Some(CacheRecord::Dir { .. }) = journal.base.get(&k) {
            delete_subtree(journal, &k);
        }

        if stat.is_dir() {
            journal.txn.insert(k.clone(), CacheRecord::dir_stub());
            let mut header_key = k;
            header_key.push(0);
            journal.txn.insert(
                header_key,
                CacheRecord::DirHeader {
                    digest: stat.digest.clone(),
                },
            );
            // The directory's own recursive digest is stale, not just the
            // parent's.
            journal.dirty_paths.insert(p);
        } else {
            let record = if stat.is_symlink() {
                CacheRecord::Symlink {
                    digest: stat.digest.clone(),
                    linkname: stat.linkname.clone(),
                }
            } else {
                CacheRecord::File {
                    digest: stat.digest.clone(),
                }
            };
            journal.txn.insert(k, record);
            journal.dirty_paths.insert(parent(&p));
        }
        Ok(())
    }
}

impl State {
    /// Commits the staged journal, first resetting every dirty directory
    /// (and all its ancestors) to a stub so cached recursive digests are
    /// invalidated eagerly.
    pub(crate) fn commit_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        let Journal {
            mut txn,
            dirty_paths,
            ..
        } = journal;

        let mut stale = BTreeSet::new();
        for dir in &dirty_paths {
            let mut cur = dir.clone();
            loop {
                stale.insert(cur.clone());
                if cur.is_empty() {
                    break;
                }
                cur = parent(&cur);
            }
        }

        for dir in &stale {
            let k = to_key(dir);
            if txn.get(&k).is_some() {
                txn.insert(k, CacheRecord::dir_stub());
            }
        }
        self.tree = txn.commit();
    }
}

fn delete_subtree(journal: &mut Journal, k: &[u8]) {
    let mut prefix = k.to_vec();
    prefix.push(0);
    let doomed: Vec<Vec<u8>> = journal
        .base
        .walk_prefix(&prefix)
        .map(|(key, _)| key.to_vec())
        .collect();
    for key in doomed {
        journal.txn.delete(&key);
    }
}

fn load_tree(md: &dyn StorageItem) -> Tree {
    let bytes = match md.get_external(CONTENT_HASH_KEY) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Tree::new(),
        Err(err) => {
            tracing::debug!(
                target = "strata.contenthash",
                layer = md.id(),
                error = %err,
                "failed to read persisted cache; starting fresh"
            );
            return Tree::new();
        }
    };

    let records = match decode_records(&bytes) {
        Ok(records) => records,
        Err(err) => {
            tracing::debug!(
                target = "strata.contenthash",
                layer = md.id(),
                error = %err,
                "failed to decode persisted cache; starting fresh"
            );
            return Tree::new();
        }
    };

    let mut txn = Tree::new().txn();
    for PersistedRecord { path, record } in records.paths {
        txn.insert(to_key(&path), record);
    }
    txn.commit()
}
