use crate::{EntryKind, RemoteSource, Store, StoreError, StoreResult, verify};
use hv_cbor::Hash;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// In-memory store. Clones share the same maps, so a clone can serve as the
/// remote peer of another replica in tests.
#[derive(Clone, Default)]
pub struct MemStore {
    nodes: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
    blobs: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("nodes", &self.len(EntryKind::Node))
            .field("blobs", &self.len(EntryKind::Blob))
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, kind: EntryKind) -> usize {
        self.map(kind).read().expect("mem store poisoned").len()
    }

    fn map(&self, kind: EntryKind) -> &RwLock<HashMap<Hash, Vec<u8>>> {
        match kind {
            EntryKind::Node => &self.nodes,
            EntryKind::Blob => &self.blobs,
        }
    }
}

impl Store for MemStore {
    fn put_raw(&self, kind: EntryKind, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        self.map(kind)
            .write()
            .expect("mem store poisoned")
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    fn get_raw(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let bytes = self
            .map(kind)
            .read()
            .expect("mem store poisoned")
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound { kind, hash })?;
        verify(kind, hash, &bytes)?;
        Ok(bytes)
    }

    fn has(&self, kind: EntryKind, hash: Hash) -> StoreResult<bool> {
        Ok(self
            .map(kind)
            .read()
            .expect("mem store poisoned")
            .contains_key(&hash))
    }
}

impl RemoteSource for MemStore {
    fn fetch(&self, kind: EntryKind, hash: Hash) -> StoreResult<Option<Vec<u8>>> {
        match self.get_raw(kind, hash) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
