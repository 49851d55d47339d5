use crate::{EntryKind, Store, StoreError, StoreResult, verify};
use hv_cbor::Hash;
use tracing::{debug, warn};

/// A source of content that is not held locally, typically a peer replica.
pub trait RemoteSource: Send + Sync {
    /// Returns `Ok(None)` when the remote does not have the entry either.
    fn fetch(&self, kind: EntryKind, hash: Hash) -> StoreResult<Option<Vec<u8>>>;
}

/// Local store with an optional remote fallback for reads.
///
/// Misses are fetched from the remote, verified against their hash and cached
/// locally. Writes only ever go to the local store.
pub struct RemoteStore<S, R> {
    local: S,
    remote: Option<R>,
}

impl<S: Store, R: RemoteSource> RemoteStore<S, R> {
    pub fn new(local: S, remote: Option<R>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &S {
        &self.local
    }

    fn fetch_remote(&self, kind: EntryKind, hash: Hash) -> Option<Vec<u8>> {
        let remote = self.remote.as_ref()?;
        match remote.fetch(kind, hash) {
            Ok(Some(bytes)) => match verify(kind, hash, &bytes) {
                Ok(()) => Some(bytes),
                Err(err) => {
                    warn!("discarding remote {kind:?} {hash}: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("error fetching remote {kind:?} {hash}: {err}");
                None
            }
        }
    }
}

impl<S: Store, R: RemoteSource> Store for RemoteStore<S, R> {
    fn put_raw(&self, kind: EntryKind, bytes: &[u8]) -> StoreResult<Hash> {
        self.local.put_raw(kind, bytes)
    }

    fn get_raw(&self, kind: EntryKind, hash: Hash) -> StoreResult<Vec<u8>> {
        match self.local.get_raw(kind, hash) {
            Err(err) if err.is_not_found() => {
                let bytes = self
                    .fetch_remote(kind, hash)
                    .ok_or(StoreError::NotFound { kind, hash })?;
                self.local.put_raw(kind, &bytes)?;
                debug!("cached remote {kind:?} {hash}");
                Ok(bytes)
            }
            other => other,
        }
    }

    fn has(&self, kind: EntryKind, hash: Hash) -> StoreResult<bool> {
        if self.local.has(kind, hash)? {
            return Ok(true);
        }
        match self.fetch_remote(kind, hash) {
            Some(bytes) => {
                self.local.put_raw(kind, &bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
