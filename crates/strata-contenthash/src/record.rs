//! The record model stored at each trie key, and its persisted shape.
//!
//! Layout in the trie: every path is stored under its cleaned absolute form.
//! Directories hold two records: the `Dir` record at the directory's own
//! key carries the recursive digest of its contents, and the `DirHeader`
//! record at that key plus a trailing separator carries the digest of the
//! directory entry itself. The root contents live at the empty key and the
//! root header at the lone-separator key.

use bincode::Options as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

use crate::error::Result;

/// Hard upper bound for any persisted blob we will attempt to decode.
///
/// Corruption should degrade to a fresh cache, not an out-of-memory crash, so
/// a corrupted length prefix must not be able to request an enormous
/// allocation.
pub(crate) const PERSIST_PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// A content digest carried as `"sha256:<lowercase hex>"`.
///
/// The empty digest marks a stub record: the path is known to exist (and its
/// type is known) but the digest has not been computed yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest of an arbitrary byte slice.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self::from_sha256(hasher)
    }

    /// Finalizes a running hash into a digest.
    pub fn from_sha256(hasher: Sha256) -> Self {
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The tagged record stored at each key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheRecord {
    /// A regular file; the digest covers content plus normalized stat
    /// metadata.
    File { digest: Digest },
    /// A symlink; `linkname` is the raw target as read from disk,
    /// forward-slash form, absolute or relative.
    Symlink { digest: Digest, linkname: String },
    /// A directory's own entry (its header, not its contents).
    DirHeader { digest: Digest },
    /// The recursive digest of a directory's contents.
    Dir { digest: Digest },
}

impl CacheRecord {
    pub fn digest(&self) -> &Digest {
        match self {
            CacheRecord::File { digest }
            | CacheRecord::Symlink { digest, .. }
            | CacheRecord::DirHeader { digest }
            | CacheRecord::Dir { digest } => digest,
        }
    }

    /// The same record with a freshly computed digest.
    pub(crate) fn with_digest(&self, digest: Digest) -> CacheRecord {
        match self {
            CacheRecord::File { .. } => CacheRecord::File { digest },
            CacheRecord::Symlink { linkname, .. } => CacheRecord::Symlink {
                digest,
                linkname: linkname.clone(),
            },
            CacheRecord::DirHeader { .. } => CacheRecord::DirHeader { digest },
            CacheRecord::Dir { .. } => CacheRecord::Dir { digest },
        }
    }

    pub fn is_stub(&self) -> bool {
        self.digest().is_empty()
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, CacheRecord::Dir { .. })
    }

    pub(crate) fn dir_stub() -> CacheRecord {
        CacheRecord::Dir {
            digest: Digest::default(),
        }
    }
}

/// The persisted blob: every `(path, record)` pair in the trie.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedRecords {
    pub paths: Vec<PersistedRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PersistedRecord {
    pub path: String,
    pub record: CacheRecord,
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn encode_records(records: &PersistedRecords) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(records)?)
}

pub(crate) fn decode_records(bytes: &[u8]) -> Result<PersistedRecords> {
    Ok(bincode_options()
        .with_limit(PERSIST_PAYLOAD_LIMIT_BYTES)
        .deserialize(bytes)?)
}
