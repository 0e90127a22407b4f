//! Process-wide cache manager: one context per layer, recency-bounded.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::cancel::CancellationToken;
use crate::context::CacheContext;
use crate::error::Result;
use crate::mount::{BindMounter, LocalMounter, Mountable};
use crate::record::Digest;
use crate::store::{StorageItem, EQUAL_MUTABLE_FIELD};

/// Default number of layer contexts retained by a manager.
pub const DEFAULT_CONTEXT_CAPACITY: usize = 20;

/// A mountable layer with attached metadata.
pub trait Layer: Mountable {
    fn metadata(&self) -> Arc<dyn StorageItem>;
}

/// Maps layer ids to cache contexts with a recency-bounded retention window.
///
/// Context construction is serialized per layer id by a striped lock, so two
/// concurrent first requests for one layer load its persisted state once;
/// requests for distinct layers proceed in parallel. The striped lock is
/// held only across the load, never across checksum work.
pub struct CacheManager {
    locker: Locker,
    contexts: Mutex<LruCache<String, Arc<CacheContext>>>,
    mounter: Arc<dyn LocalMounter>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CONTEXT_CAPACITY, Arc::new(BindMounter))
    }

    pub fn with_capacity(capacity: usize, mounter: Arc<dyn LocalMounter>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            locker: Locker::default(),
            contexts: Mutex::new(LruCache::new(capacity)),
            mounter,
        }
    }

    /// Top-level memoized digest of `p` inside `layer`.
    ///
    /// Resolves the layer's canonical origin through the `cache.equalMutable`
    /// indirection when present.
    pub fn checksum<L: Layer>(
        &self,
        layer: &L,
        p: &str,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        let md = ensure_origin_metadata(layer.metadata());
        let cc = self.get_cache_context(md)?;
        cc.checksum(layer, p, cancel)
    }

    /// Returns the context for `md`, constructing and caching it on first
    /// use.
    pub fn get_cache_context(&self, md: Arc<dyn StorageItem>) -> Result<Arc<CacheContext>> {
        let id = md.id().to_string();
        let _named = self.locker.lock(&id);

        if let Some(cc) = self.contexts.lock().get(&id) {
            return Ok(cc.clone());
        }

        let cc = CacheContext::new(md, self.mounter.clone())?;
        self.insert_context(id, cc.clone());
        Ok(cc)
    }

    /// Registers `cc` under `md`'s identity.
    ///
    /// With a matching id the context is persisted in place; otherwise a new
    /// context is synthesized sharing the trie snapshot, with a fresh
    /// journal, and registered under the new id.
    pub fn set_cache_context(
        &self,
        md: Arc<dyn StorageItem>,
        cc: Arc<CacheContext>,
    ) -> Result<Arc<CacheContext>> {
        let cc = if md.id() == cc.id() {
            cc.save()?;
            cc
        } else {
            CacheContext::with_tree(md, self.mounter.clone(), cc.snapshot())
        };
        self.insert_context(cc.id().to_string(), cc.clone());
        Ok(cc)
    }

    fn insert_context(&self, id: String, cc: Arc<CacheContext>) {
        let evicted = self.contexts.lock().push(id.clone(), cc);
        if let Some((evicted_id, evicted)) = evicted {
            if evicted_id != id && evicted.is_dirty() {
                // Unsaved state would be lost with the context; persist it
                // before letting go. The cache is advisory, so a failure is
                // logged and the eviction proceeds.
                if let Err(err) = evicted.save() {
                    tracing::warn!(
                        target = "strata.contenthash",
                        layer = %evicted_id,
                        error = %err,
                        "failed to persist evicted cache context"
                    );
                }
            }
        }
    }
}

/// Follows the one-hop `cache.equalMutable` indirection to the layer's
/// canonical origin metadata, when present and resolvable.
fn ensure_origin_metadata(md: Arc<dyn StorageItem>) -> Arc<dyn StorageItem> {
    let Some(raw) = md.get(EQUAL_MUTABLE_FIELD) else {
        return md;
    };
    let Ok(origin_id) = String::from_utf8(raw) else {
        return md;
    };
    let Some(storage) = md.storage() else {
        return md;
    };
    match storage.get(&origin_id) {
        Some(origin) => origin,
        None => md,
    }
}

/// Striped lock: one mutex per live key, entries reclaimed when the last
/// waiter releases.
#[derive(Default)]
struct Locker {
    locks: Mutex<HashMap<String, LockEntry>>,
}

struct LockEntry {
    mu: Arc<Mutex<()>>,
    waiters: usize,
}

struct NamedGuard<'a> {
    locker: &'a Locker,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Locker {
    fn lock(&self, key: &str) -> NamedGuard<'_> {
        let mu = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(key.to_string()).or_insert_with(|| LockEntry {
                mu: Arc::new(Mutex::new(())),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.mu.clone()
        };
        let guard = mu.lock_arc();
        NamedGuard {
            locker: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

impl Drop for NamedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locker.locks.lock();
        if let Some(entry) = locks.get_mut(&self.key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                locks.remove(&self.key);
            }
        }
    }
}
