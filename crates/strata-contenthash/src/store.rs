//! Metadata-store contracts, plus in-memory implementations.
//!
//! The cache persists one opaque blob per layer under a fixed key and reads
//! one indirection field; everything else about the store is the embedder's
//! business. The in-memory implementations are suitable for tests and for
//! embedders that manage persistence elsewhere.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;

/// Blob key the serialized cache is persisted under.
pub const CONTENT_HASH_KEY: &str = "buildkit.contenthash.v0";

/// Metadata field naming the canonical origin layer, when present.
pub const EQUAL_MUTABLE_FIELD: &str = "cache.equalMutable";

/// Per-layer metadata record.
pub trait StorageItem: Send + Sync {
    /// Stable layer identity.
    fn id(&self) -> &str;

    /// Reads a metadata field, e.g. the `cache.equalMutable` indirection.
    fn get(&self, field: &str) -> Option<Vec<u8>>;

    /// Reads an external blob. A missing blob is `Ok(None)`.
    fn get_external(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes an external blob.
    fn set_external(&self, key: &str, data: &[u8]) -> Result<()>;

    /// The store this item belongs to, for resolving indirections.
    fn storage(&self) -> Option<Arc<dyn MetadataStorage>> {
        None
    }
}

/// Lookup of metadata records by layer id.
pub trait MetadataStorage: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<dyn StorageItem>>;
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    items: Mutex<HashMap<String, Arc<MemoryStorageItem>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the item for `id`, creating it on first use.
    pub fn item(self: &Arc<Self>, id: &str) -> Arc<MemoryStorageItem> {
        let mut items = self.items.lock();
        items
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryStorageItem {
                    id: id.to_string(),
                    fields: Mutex::new(HashMap::new()),
                    external: Mutex::new(HashMap::new()),
                    storage: Arc::downgrade(self),
                })
            })
            .clone()
    }
}

impl MetadataStorage for MemoryMetadataStore {
    fn get(&self, id: &str) -> Option<Arc<dyn StorageItem>> {
        let items = self.items.lock();
        items.get(id).map(|item| item.clone() as Arc<dyn StorageItem>)
    }
}

/// In-memory per-layer metadata record.
pub struct MemoryStorageItem {
    id: String,
    fields: Mutex<HashMap<String, Vec<u8>>>,
    external: Mutex<HashMap<String, Vec<u8>>>,
    storage: Weak<MemoryMetadataStore>,
}

impl MemoryStorageItem {
    /// Standalone item not attached to any store.
    pub fn detached(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fields: Mutex::new(HashMap::new()),
            external: Mutex::new(HashMap::new()),
            storage: Weak::new(),
        })
    }

    pub fn set_field(&self, field: &str, value: &[u8]) {
        self.fields.lock().insert(field.to_string(), value.to_vec());
    }
}

impl StorageItem for MemoryStorageItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, field: &str) -> Option<Vec<u8>> {
        self.fields.lock().get(field).cloned()
    }

    fn get_external(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.external.lock().get(key).cloned())
    }

    fn set_external(&self, key: &str, data: &[u8]) -> Result<()> {
        self.external.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn storage(&self) -> Option<Arc<dyn MetadataStorage>> {
        self.storage
            .upgrade()
            .map(|store| store as Arc<dyn MetadataStorage>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_round_trip_external_blobs() {
        let store = MemoryMetadataStore::new();
        let item = store.item("layer-a");

        assert_eq!(item.get_external(CONTENT_HASH_KEY).unwrap(), None);
        item.set_external(CONTENT_HASH_KEY, b"blob").unwrap();
        assert_eq!(
            item.get_external(CONTENT_HASH_KEY).unwrap(),
            Some(b"blob".to_vec())
        );
    }

    #[test]
    fn items_resolve_back_to_their_store() {
        let store = MemoryMetadataStore::new();
        let a = store.item("a");
        a.set_field(EQUAL_MUTABLE_FIELD, b"b");
        store.item("b");

        let storage = a.storage().expect("attached item has a store");
        assert!(storage.get("b").is_some());
        assert!(storage.get("missing").is_none());
    }
}
