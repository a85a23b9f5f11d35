//! The contract this crate demands from its backing store: an ordered
//! key-value store with serializable read-write transactions, ranged reads,
//! versionstamp substitution, and one-shot key watches. The store itself is
//! an external collaborator; [`memory::Memory`] is the in-process rendering
//! used by embedders that want a single-process lock and by the test suite.

pub mod memory;
pub mod tuple;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CResult, Error};

/// A contiguous span of keys, begin-inclusive and end-exclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(begin: Vec<u8>, end: Vec<u8>) -> Self {
        KeyRange { begin, end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

/// An ordered transactional key-value store.
pub trait Store {
    type Txn<'a>: Txn
    where
        Self: 'a;

    /// Runs f inside one serializable transaction and commits it. The store
    /// retries f on conflict, so f must be idempotent and must not leak
    /// caller-visible state between attempts. A returned error aborts the
    /// transaction without applying any of its writes.
    fn transact<T>(&self, f: impl FnMut(&mut Self::Txn<'_>) -> CResult<T>) -> CResult<T>;
}

/// One in-flight transaction. Writes become visible to other transactions
/// only at commit; reads observe the transaction's own buffered writes.
pub trait Txn {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Ascending range read, optionally truncated to the first limit pairs.
    fn scan(&mut self, range: KeyRange, limit: Option<usize>)
        -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, range: KeyRange);

    /// Sets a key whose buffer ends in a 4-byte little-endian offset naming
    /// its 10 transaction-version bytes; the store substitutes the commit
    /// version there, which orders such keys by commit.
    fn set_versionstamped_key(&mut self, key: &[u8], value: &[u8]) -> CResult<()>;

    /// The same substitution, applied to the value buffer instead.
    fn set_versionstamped_value(&mut self, key: &[u8], value: &[u8]) -> CResult<()>;

    /// Registers a one-shot watch on key, armed when this transaction
    /// commits against the value the commit leaves behind.
    fn watch(&mut self, key: &[u8]) -> Watch;
}

/// A single-shot signal that fires when the watched key's committed value
/// first differs from the value observed at registration, clears included.
/// Dropping the handle cancels the watch.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<()>,
}

impl Watch {
    pub(crate) fn new(rx: oneshot::Receiver<()>) -> Self {
        Watch { rx }
    }

    /// Resolves when the watch fires; errors when the store drops it first.
    pub async fn fired(self) -> CResult<()> {
        self.rx
            .await
            .map_err(|_| Error::Store("watch cancelled by the store".into()))
    }

    /// Resolves when the watch fires or ctx is cancelled, whichever is
    /// first. Cancellation releases the store-side registration.
    pub async fn recv(self, ctx: &CancellationToken) -> CResult<()> {
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            fired = self.fired() => fired,
        }
    }
}
