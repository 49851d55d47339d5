//! Layout of actor state inside the [`StateTree`].
//!
//! Each actor is one tree entry keyed by its ID bytes with value
//! `(type_tag, nonce)`. Slot `"1"` links the code blob and slot `"2"` links the
//! storage node. The single-byte key `[0]` holds the global creation nonce and
//! can never collide with an ID.

use hv_store::{StateTree, Store, TreeError};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::KernelError;
use crate::id::ActorId;

pub const NONCE_KEY: &[u8] = &[0];
pub const CODE_SLOT: &str = "1";
pub const STORAGE_SLOT: &str = "2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u32, u64)", into = "(u32, u64)")]
pub struct ActorRecord {
    pub type_tag: u32,
    pub nonce: u64,
}

impl From<(u32, u64)> for ActorRecord {
    fn from((type_tag, nonce): (u32, u64)) -> Self {
        Self { type_tag, nonce }
    }
}

impl From<ActorRecord> for (u32, u64) {
    fn from(record: ActorRecord) -> Self {
        (record.type_tag, record.nonce)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageNode(Vec<ByteBuf>);

pub(crate) fn exists<S: Store>(tree: &StateTree<S>, id: ActorId) -> Result<bool, TreeError> {
    Ok(tree.try_get(id.as_bytes())?.is_some())
}

/// Write a fresh record with empty storage.
pub(crate) fn write_new<S: Store>(
    tree: &mut StateTree<S>,
    id: ActorId,
    type_tag: u32,
    code: &[u8],
) -> Result<(), KernelError> {
    if exists(tree, id)? {
        return Err(KernelError::ActorExists(id));
    }
    let key = id.as_bytes();
    tree.set(key, &ActorRecord { type_tag, nonce: 0 })?;
    tree.link_blob(key, CODE_SLOT, code)?;
    tree.link_node(key, STORAGE_SLOT, &StorageNode::default())?;
    Ok(())
}

/// Persist the mutable half of an actor. The code slot is left untouched.
pub(crate) fn write_state<S: Store>(
    tree: &mut StateTree<S>,
    id: ActorId,
    record: ActorRecord,
    storage: &[Vec<u8>],
) -> Result<(), TreeError> {
    let key = id.as_bytes();
    tree.set(key, &record)?;
    let node = StorageNode(storage.iter().cloned().map(ByteBuf::from).collect());
    tree.link_node(key, STORAGE_SLOT, &node)?;
    Ok(())
}

pub fn read_record<S: Store>(tree: &StateTree<S>, id: ActorId) -> Result<ActorRecord, KernelError> {
    let entry = tree
        .try_get(id.as_bytes())?
        .ok_or(KernelError::UnknownActor(id))?;
    entry.decode_value().map_err(|e| malformed(id, e))
}

pub fn read_code<S: Store>(tree: &StateTree<S>, id: ActorId) -> Result<Vec<u8>, KernelError> {
    read_record(tree, id)?;
    tree.linked_blob(id.as_bytes(), CODE_SLOT)
        .map_err(|e| malformed(id, e))
}

pub fn read_storage<S: Store>(tree: &StateTree<S>, id: ActorId) -> Result<Vec<Vec<u8>>, KernelError> {
    read_record(tree, id)?;
    let node: StorageNode = tree
        .linked_node(id.as_bytes(), STORAGE_SLOT)
        .map_err(|e| malformed(id, e))?;
    Ok(node.0.into_iter().map(ByteBuf::into_vec).collect())
}

pub(crate) fn read_nonce<S: Store>(tree: &StateTree<S>) -> Result<u64, KernelError> {
    match tree.try_get(NONCE_KEY)? {
        Some(entry) => Ok(entry.decode_value()?),
        None => Ok(0),
    }
}

pub(crate) fn write_nonce<S: Store>(tree: &mut StateTree<S>, nonce: u64) -> Result<(), KernelError> {
    tree.set(NONCE_KEY, &nonce)?;
    Ok(())
}

fn malformed(id: ActorId, err: TreeError) -> KernelError {
    KernelError::MalformedState {
        id,
        reason: err.to_string(),
    }
}
