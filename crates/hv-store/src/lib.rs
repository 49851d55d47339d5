//! Content-addressed storage for the hypervisor: raw node/blob stores, a remote
//! fallback wrapper, and the persistent [`StateTree`] that actor records live in.

mod fs_store;
mod mem_store;
mod remote;
pub mod tree;

pub use fs_store::FsStore;
pub use mem_store::MemStore;
pub use remote::{RemoteSource, RemoteStore};
pub use tree::{StateTree, TreeEntry, TreeError, TreeResult};

use hv_cbor::{Hash, to_canonical_cbor};
use serde::{Serialize, de::DeserializeOwned};
use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

/// Trait implemented by all content-addressed stores.
///
/// Backends only deal in raw bytes; every read must re-hash what it returns.
/// The typed node helpers are layered on top.
pub trait Store: Send + Sync {
    fn put_raw(&self, kind: EntryKind, bytes: &[u8]) -> StoreResult<Hash>;
    fn get_raw(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>>;
    fn has(&self, kind: EntryKind, hash: Hash) -> StoreResult<bool>;

    fn put_node<T: Serialize>(&self, value: &T) -> StoreResult<Hash>
    where
        Self: Sized,
    {
        let bytes = to_canonical_cbor(value)?;
        self.put_raw(EntryKind::Node, &bytes)
    }

    fn get_node<T: DeserializeOwned>(&self, hash: Hash) -> StoreResult<T>
    where
        Self: Sized,
    {
        let bytes = self.get_raw(EntryKind::Node, hash)?;
        Ok(serde_cbor::from_slice(&bytes)?)
    }

    fn has_node(&self, hash: Hash) -> StoreResult<bool> {
        self.has(EntryKind::Node, hash)
    }

    fn put_blob(&self, bytes: &[u8]) -> StoreResult<Hash> {
        self.put_raw(EntryKind::Blob, bytes)
    }

    fn get_blob(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        self.get_raw(EntryKind::Blob, hash)
    }

    fn has_blob(&self, hash: Hash) -> StoreResult<bool> {
        self.has(EntryKind::Blob, hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind:?} {hash} not found")]
    NotFound { kind: EntryKind, hash: Hash },
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("hash mismatch for {kind:?}: expected {expected}, got {actual}")]
    HashMismatch {
        kind: EntryKind,
        expected: Hash,
        actual: Hash,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Node,
    Blob,
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

pub(crate) fn verify(kind: EntryKind, expected: Hash, bytes: &[u8]) -> StoreResult<()> {
    let actual = Hash::of_bytes(bytes);
    if actual != expected {
        return Err(StoreError::HashMismatch {
            kind,
            expected,
            actual,
        });
    }
    Ok(())
}
