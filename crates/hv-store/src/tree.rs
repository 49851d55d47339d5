//! Persistent key/value tree with per-entry link slots.
//!
//! Committed state lives in a CAS radix index that fans out on the SHA-256 of
//! each key. Writes land in an in-memory overlay and only reach the index on
//! [`StateTree::flush`], which returns the new root hash. Leaves are kept sorted
//! by key hash so the same set of entries always produces the same root.

use std::collections::BTreeMap;
use std::sync::Arc;

use hv_cbor::{Hash, to_canonical_cbor};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Store, StoreError};

const LEAF_MAX: usize = 64;
const MAX_DEPTH: usize = 32;

pub type TreeResult<T> = Result<T, TreeError>;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("key {0} not found")]
    NotFound(String),
    #[error("key {key} has no link in slot '{slot}'")]
    MissingLink { key: String, slot: String },
    #[error("root {0} is not present in the store")]
    UnknownRoot(Hash),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// One key in the tree: its encoded value plus named links into the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub key_hash: Hash,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub links: BTreeMap<String, Hash>,
}

impl TreeEntry {
    fn new(key: &[u8], value: Vec<u8>) -> Self {
        Self {
            key_hash: Hash::of_bytes(key),
            key: key.to_vec(),
            value,
            links: BTreeMap::new(),
        }
    }

    pub fn decode_value<T: DeserializeOwned>(&self) -> TreeResult<T> {
        Ok(serde_cbor::from_slice(&self.value)?)
    }

    pub fn link(&self, slot: &str) -> Option<Hash> {
        self.links.get(slot).copied()
    }
}

// Untagged: a self-described top-level enum does not decode. Leaf entries
// are maps and branch children are pairs, so the shapes never overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Node {
    Leaf(Vec<TreeEntry>),
    /// fan-out on a single byte of the key hash
    Branch(Vec<(u8, Hash)>),
}

pub struct StateTree<S: Store> {
    store: Arc<S>,
    root: Hash,
    overlay: BTreeMap<Vec<u8>, Option<TreeEntry>>,
}

impl<S: Store> StateTree<S> {
    /// An empty tree backed by `store`.
    pub fn new(store: Arc<S>) -> TreeResult<Self> {
        let root = empty_root(store.as_ref())?;
        Ok(Self {
            store,
            root,
            overlay: BTreeMap::new(),
        })
    }

    /// Open an existing root.
    pub fn open(store: Arc<S>, root: Hash) -> TreeResult<Self> {
        let mut tree = Self::new(store)?;
        tree.set_root(root)?;
        Ok(tree)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Root of the last flush. Does not include overlay writes.
    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn is_dirty(&self) -> bool {
        !self.overlay.is_empty()
    }

    /// Repoint at a previously flushed root, discarding any unflushed writes.
    pub fn set_root(&mut self, root: Hash) -> TreeResult<()> {
        if !self.store.has_node(root)? {
            return Err(TreeError::UnknownRoot(root));
        }
        self.root = root;
        self.overlay.clear();
        Ok(())
    }

    pub fn try_get(&self, key: &[u8]) -> TreeResult<Option<TreeEntry>> {
        if let Some(pending) = self.overlay.get(key) {
            return Ok(pending.clone());
        }
        let key_hash = Hash::of_bytes(key);
        get_at(self.store.as_ref(), self.root, &key_hash, 0)
    }

    pub fn get(&self, key: &[u8]) -> TreeResult<TreeEntry> {
        self.try_get(key)?
            .ok_or_else(|| TreeError::NotFound(hex::encode(key)))
    }

    /// Set the value for `key`, keeping any links the entry already had.
    pub fn set<T: Serialize>(&mut self, key: &[u8], value: &T) -> TreeResult<()> {
        let bytes = to_canonical_cbor(value)?;
        let entry = match self.try_get(key)? {
            Some(mut existing) => {
                existing.value = bytes;
                existing
            }
            None => TreeEntry::new(key, bytes),
        };
        self.overlay.insert(key.to_vec(), Some(entry));
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> TreeResult<bool> {
        let existed = self.try_get(key)?.is_some();
        if existed {
            self.overlay.insert(key.to_vec(), None);
        }
        Ok(existed)
    }

    /// Point `slot` of an existing entry at `target`.
    pub fn set_link(&mut self, key: &[u8], slot: &str, target: Hash) -> TreeResult<()> {
        let mut entry = self.get(key)?;
        entry.links.insert(slot.to_string(), target);
        self.overlay.insert(key.to_vec(), Some(entry));
        Ok(())
    }

    pub fn link_blob(&mut self, key: &[u8], slot: &str, bytes: &[u8]) -> TreeResult<Hash> {
        let hash = self.store.put_blob(bytes)?;
        self.set_link(key, slot, hash)?;
        Ok(hash)
    }

    pub fn link_node<T: Serialize>(&mut self, key: &[u8], slot: &str, value: &T) -> TreeResult<Hash> {
        let hash = self.store.put_node(value)?;
        self.set_link(key, slot, hash)?;
        Ok(hash)
    }

    pub fn linked_blob(&self, key: &[u8], slot: &str) -> TreeResult<Vec<u8>> {
        let hash = self.require_link(key, slot)?;
        Ok(self.store.get_blob(hash)?)
    }

    pub fn linked_node<T: DeserializeOwned>(&self, key: &[u8], slot: &str) -> TreeResult<T> {
        let hash = self.require_link(key, slot)?;
        Ok(self.store.get_node(hash)?)
    }

    fn require_link(&self, key: &[u8], slot: &str) -> TreeResult<Hash> {
        self.get(key)?
            .link(slot)
            .ok_or_else(|| TreeError::MissingLink {
                key: hex::encode(key),
                slot: slot.to_string(),
            })
    }

    /// Apply pending writes in key order and return the new root.
    pub fn flush(&mut self) -> TreeResult<Hash> {
        let store = self.store.as_ref();
        let mut root = self.root;
        for (key, change) in std::mem::take(&mut self.overlay) {
            root = match change {
                Some(entry) => insert_at(store, root, entry, 0)?,
                None => {
                    let key_hash = Hash::of_bytes(&key);
                    match delete_at(store, root, &key_hash, 0)? {
                        (Some(hash), _) => hash,
                        (None, _) => empty_root(store)?,
                    }
                }
            };
        }
        self.root = root;
        Ok(root)
    }

    /// All committed entries in key-hash order.
    pub fn entries(&self) -> TreeResult<Vec<TreeEntry>> {
        let mut out = Vec::new();
        collect(self.store.as_ref(), self.root, &mut out)?;
        Ok(out)
    }
}

/// Root hash of a tree with no entries.
pub fn empty_root<S: Store>(store: &S) -> TreeResult<Hash> {
    Ok(store.put_node(&Node::Leaf(Vec::new()))?)
}

fn get_at<S: Store>(
    store: &S,
    node_hash: Hash,
    key_hash: &Hash,
    depth: usize,
) -> TreeResult<Option<TreeEntry>> {
    match store.get_node::<Node>(node_hash)? {
        Node::Leaf(entries) => Ok(entries.into_iter().find(|e| &e.key_hash == key_hash)),
        Node::Branch(children) => {
            let Some(byte) = key_hash.as_bytes().get(depth).copied() else {
                return Ok(None);
            };
            match children.into_iter().find(|(b, _)| *b == byte) {
                Some((_, child)) => get_at(store, child, key_hash, depth + 1),
                None => Ok(None),
            }
        }
    }
}

fn insert_at<S: Store>(store: &S, node_hash: Hash, entry: TreeEntry, depth: usize) -> TreeResult<Hash> {
    match store.get_node::<Node>(node_hash)? {
        Node::Leaf(mut entries) => {
            match entries.binary_search_by(|e| e.key_hash.cmp(&entry.key_hash)) {
                Ok(idx) => entries[idx] = entry,
                Err(idx) => entries.insert(idx, entry),
            }
            if entries.len() > LEAF_MAX && depth < MAX_DEPTH {
                split_leaf(store, entries, depth)
            } else {
                Ok(store.put_node(&Node::Leaf(entries))?)
            }
        }
        Node::Branch(mut children) => {
            let byte = entry.key_hash.as_bytes()[depth];
            match children.binary_search_by_key(&byte, |(b, _)| *b) {
                Ok(idx) => {
                    children[idx].1 = insert_at(store, children[idx].1, entry, depth + 1)?;
                }
                Err(idx) => {
                    let leaf = store.put_node(&Node::Leaf(vec![entry]))?;
                    children.insert(idx, (byte, leaf));
                }
            }
            Ok(store.put_node(&Node::Branch(children))?)
        }
    }
}

fn delete_at<S: Store>(
    store: &S,
    node_hash: Hash,
    key_hash: &Hash,
    depth: usize,
) -> TreeResult<(Option<Hash>, bool)> {
    match store.get_node::<Node>(node_hash)? {
        Node::Leaf(mut entries) => {
            let before = entries.len();
            entries.retain(|e| &e.key_hash != key_hash);
            let removed = before != entries.len();
            if entries.is_empty() {
                Ok((None, removed))
            } else {
                Ok((Some(store.put_node(&Node::Leaf(entries))?), removed))
            }
        }
        Node::Branch(mut children) => {
            let byte = key_hash.as_bytes()[depth];
            let Ok(idx) = children.binary_search_by_key(&byte, |(b, _)| *b) else {
                return Ok((Some(node_hash), false));
            };
            let (child, removed) = delete_at(store, children[idx].1, key_hash, depth + 1)?;
            if !removed {
                return Ok((Some(node_hash), false));
            }
            match child {
                Some(hash) => children[idx].1 = hash,
                None => {
                    children.remove(idx);
                }
            }
            if children.is_empty() {
                return Ok((None, true));
            }
            if let Some(entries) = merge_small(store, &children)? {
                return Ok((Some(store.put_node(&Node::Leaf(entries))?), true));
            }
            Ok((Some(store.put_node(&Node::Branch(children))?), true))
        }
    }
}

/// Entries of a branch that has shrunk back to leaf size. A branch child
/// always holds more than `LEAF_MAX` entries, so only all-leaf branches can
/// qualify. Keeps the shape a function of the entry set.
fn merge_small<S: Store>(store: &S, children: &[(u8, Hash)]) -> TreeResult<Option<Vec<TreeEntry>>> {
    let mut merged = Vec::new();
    for (_, child) in children {
        match store.get_node::<Node>(*child)? {
            Node::Leaf(entries) => merged.extend(entries),
            Node::Branch(_) => return Ok(None),
        }
        if merged.len() > LEAF_MAX {
            return Ok(None);
        }
    }
    merged.sort_by(|a, b| a.key_hash.cmp(&b.key_hash));
    Ok(Some(merged))
}

fn split_leaf<S: Store>(store: &S, entries: Vec<TreeEntry>, depth: usize) -> TreeResult<Hash> {
    let mut buckets: BTreeMap<u8, Vec<TreeEntry>> = BTreeMap::new();
    for entry in entries {
        buckets
            .entry(entry.key_hash.as_bytes()[depth])
            .or_default()
            .push(entry);
    }
    let mut children = Vec::with_capacity(buckets.len());
    for (byte, bucket) in buckets {
        let child = if bucket.len() > LEAF_MAX && depth + 1 < MAX_DEPTH {
            split_leaf(store, bucket, depth + 1)?
        } else {
            store.put_node(&Node::Leaf(bucket))?
        };
        children.push((byte, child));
    }
    Ok(store.put_node(&Node::Branch(children))?)
}

fn collect<S: Store>(store: &S, node_hash: Hash, out: &mut Vec<TreeEntry>) -> TreeResult<()> {
    match store.get_node::<Node>(node_hash)? {
        Node::Leaf(entries) => out.extend(entries),
        Node::Branch(children) => {
            for (_, child) in children {
                collect(store, child, out)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    fn tree() -> StateTree<MemStore> {
        StateTree::new(Arc::new(MemStore::new())).unwrap()
    }

    #[test]
    fn leaf_and_branch_nodes_decode_from_the_store() {
        let store = MemStore::new();
        let empty = empty_root(&store).unwrap();
        assert!(matches!(store.get_node::<Node>(empty).unwrap(), Node::Leaf(e) if e.is_empty()));

        let mut tree = StateTree::new(Arc::new(store.clone())).unwrap();
        for i in 0u32..(LEAF_MAX as u32 + 1) {
            tree.set(&i.to_be_bytes(), &i).unwrap();
        }
        let root = tree.flush().unwrap();
        assert!(matches!(store.get_node::<Node>(root).unwrap(), Node::Branch(_)));
        assert_eq!(tree.get(&7u32.to_be_bytes()).unwrap().decode_value::<u32>().unwrap(), 7);
    }

    #[test]
    fn writes_are_provisional_until_flush() {
        let mut tree = tree();
        let empty = tree.root();
        tree.set(b"actor", &(1u32, 0u64)).unwrap();
        assert_eq!(tree.root(), empty);
        assert!(tree.is_dirty());
        assert_eq!(tree.get(b"actor").unwrap().decode_value::<(u32, u64)>().unwrap(), (1, 0));

        let root = tree.flush().unwrap();
        assert_ne!(root, empty);
        assert!(!tree.is_dirty());
    }

    #[test]
    fn unknown_key_is_not_found() {
        let tree = tree();
        assert!(matches!(tree.get(b"missing"), Err(TreeError::NotFound(_))));
    }

    #[test]
    fn set_keeps_existing_links() {
        let mut tree = tree();
        tree.set(b"a", &(1u32, 0u64)).unwrap();
        tree.link_blob(b"a", "1", b"wasm").unwrap();
        tree.flush().unwrap();

        tree.set(b"a", &(1u32, 4u64)).unwrap();
        assert_eq!(tree.linked_blob(b"a", "1").unwrap(), b"wasm");
        assert!(matches!(
            tree.linked_blob(b"a", "2"),
            Err(TreeError::MissingLink { .. })
        ));
    }

    #[test]
    fn root_is_independent_of_write_order() {
        let store = Arc::new(MemStore::new());
        let mut forward = StateTree::new(store.clone()).unwrap();
        let mut backward = StateTree::new(store).unwrap();
        for i in 0u32..200 {
            forward.set(&i.to_be_bytes(), &i).unwrap();
            forward.flush().unwrap();
        }
        for i in (0u32..200).rev() {
            backward.set(&i.to_be_bytes(), &i).unwrap();
        }
        assert_eq!(forward.flush().unwrap(), backward.flush().unwrap());
        assert_eq!(forward.entries().unwrap().len(), 200);
    }

    #[test]
    fn set_root_restores_history_and_drops_overlay() {
        let mut tree = tree();
        tree.set(b"k", &1u8).unwrap();
        let first = tree.flush().unwrap();
        tree.set(b"k", &2u8).unwrap();
        tree.flush().unwrap();
        tree.set(b"other", &3u8).unwrap();

        tree.set_root(first).unwrap();
        assert!(!tree.is_dirty());
        assert_eq!(tree.get(b"k").unwrap().decode_value::<u8>().unwrap(), 1);
        assert!(tree.try_get(b"other").unwrap().is_none());
        assert!(matches!(
            tree.set_root(Hash::of_bytes(b"bogus")),
            Err(TreeError::UnknownRoot(_))
        ));
    }

    #[test]
    fn shrinking_past_a_split_matches_a_fresh_tree() {
        let store = Arc::new(MemStore::new());
        let mut grown = StateTree::new(store.clone()).unwrap();
        for i in 0u32..100 {
            grown.set(&i.to_be_bytes(), &i).unwrap();
        }
        grown.flush().unwrap();
        for i in 10u32..100 {
            grown.remove(&i.to_be_bytes()).unwrap();
        }

        let mut fresh = StateTree::new(store).unwrap();
        for i in 0u32..10 {
            fresh.set(&i.to_be_bytes(), &i).unwrap();
        }
        assert_eq!(grown.flush().unwrap(), fresh.flush().unwrap());
    }

    #[test]
    fn remove_then_flush_returns_to_empty_root() {
        let mut tree = tree();
        let empty = tree.root();
        tree.set(b"k", &1u8).unwrap();
        tree.flush().unwrap();
        assert!(tree.remove(b"k").unwrap());
        assert_eq!(tree.flush().unwrap(), empty);
        assert!(!tree.remove(b"k").unwrap());
    }
}
