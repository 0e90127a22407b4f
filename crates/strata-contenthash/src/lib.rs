//! Content-hash cache for mountable filesystem layers.
//!
//! Given a mountable reference to an immutable layer and a path inside it,
//! [`CacheManager::checksum`] computes a stable digest of that path: a
//! file's content-and-metadata digest, a symlink's metadata digest, or the
//! recursive digest of a directory's contents. It memoizes every
//! intermediate digest so repeated and overlapping queries do no redundant
//! I/O.
//!
//! The crate is organized around:
//! - a record trie indexing every observed path (`strata-pathmap` keys are
//!   the cleaned path with `/` mapped to `0x00`, so trie order is canonical
//!   directory order);
//! - lazy on-demand scans that populate stub records;
//! - a change journal applying filesystem notifications in a staged
//!   transaction, committed on the next read;
//! - per-layer contexts behind one read/write lock, persisted out-of-band
//!   to a metadata store whenever a checksum dirties them;
//! - a process-wide manager with a recency-bounded context window.
//!
//! Mounting, persistence and single-file hashing are narrow contracts
//! ([`Mountable`]/[`LocalMounter`], [`StorageItem`]/[`MetadataStorage`],
//! [`file_digest`]); everything else lives here.

mod cancel;
mod change;
mod checksum;
mod context;
mod error;
mod filehash;
mod manager;
mod mount;
mod path;
mod record;
mod resolve;
mod scan;
mod store;

pub use cancel::CancellationToken;
pub use change::{ChangeKind, ChangeStat};
pub use context::CacheContext;
pub use error::{CacheError, Result};
pub use filehash::file_digest;
pub use manager::{CacheManager, Layer, DEFAULT_CONTEXT_CAPACITY};
pub use mount::{ActiveMount, BindMounter, LocalMounter, MountEntry, Mountable};
pub use record::{CacheRecord, Digest};
pub use store::{
    MemoryMetadataStore, MemoryStorageItem, MetadataStorage, StorageItem, CONTENT_HASH_KEY,
    EQUAL_MUTABLE_FIELD,
};

use once_cell::sync::Lazy;

/// Maximum symlink traversals before resolution fails.
pub(crate) const MAX_SYMLINK_HOPS: u32 = 255;

static DEFAULT_MANAGER: Lazy<CacheManager> = Lazy::new(CacheManager::new);

/// The process-wide default manager.
pub fn default_manager() -> &'static CacheManager {
    &DEFAULT_MANAGER
}

/// Computes `checksum` against the process-wide default manager.
pub fn checksum<L: Layer>(layer: &L, path: &str, cancel: &CancellationToken) -> Result<Digest> {
    default_manager().checksum(layer, path, cancel)
}
