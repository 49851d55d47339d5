use crate::{EntryKind, RemoteSource, Store, StoreError, StoreResult, io_error, verify};
use hv_cbor::Hash;
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

/// Filesystem-backed store rooted at `<root>/.store`.
#[derive(Clone)]
pub struct FsStore {
    nodes_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl fmt::Debug for FsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStore")
            .field("nodes_dir", &self.nodes_dir)
            .field("blobs_dir", &self.blobs_dir)
            .finish()
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let store_root = root.as_ref().join(".store");
        let nodes_dir = store_root.join("nodes").join("sha256");
        let blobs_dir = store_root.join("blobs").join("sha256");
        fs::create_dir_all(&nodes_dir).map_err(|e| io_error(&nodes_dir, e))?;
        fs::create_dir_all(&blobs_dir).map_err(|e| io_error(&blobs_dir, e))?;
        Ok(Self {
            nodes_dir,
            blobs_dir,
        })
    }

    fn path(&self, kind: EntryKind, hash: &Hash) -> PathBuf {
        let dir = match kind {
            EntryKind::Node => &self.nodes_dir,
            EntryKind::Blob => &self.blobs_dir,
        };
        dir.join(hex::encode(hash.as_bytes()))
    }

    // Content addressing makes a second write of the same path a no-op.
    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(path, e))?;
                file.sync_all().map_err(|e| io_error(path, e))?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

impl Store for FsStore {
    fn put_raw(&self, kind: EntryKind, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::of_bytes(bytes);
        Self::write_once(&self.path(kind, &hash), bytes)?;
        Ok(hash)
    }

    fn get_raw(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        let path = self.path(kind, &hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound { kind, hash });
            }
            Err(err) => return Err(io_error(path, err)),
        };
        verify(kind, hash, &bytes)?;
        Ok(bytes)
    }

    fn has(&self, kind: EntryKind, hash: Hash) -> StoreResult<bool> {
        Ok(self.path(kind, &hash).exists())
    }
}

/// Another node's state directory serving as a read-only peer.
impl RemoteSource for FsStore {
    fn fetch(&self, kind: EntryKind, hash: Hash) -> StoreResult<Option<Vec<u8>>> {
        match self.get_raw(kind, hash) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
