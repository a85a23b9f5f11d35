//! An in-memory rendering of the store contract, backed by a BTreeMap. One
//! lock spans each whole transaction, so transactions execute serially and
//! serializability is trivial; the conflict-retry loop of the contract never
//! takes a second turn. Commit versions count up from one and supply the
//! transaction-version bytes of versionstamps.

use std::collections::BTreeMap;
use std::ops::Bound;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tokio::sync::oneshot;

use crate::error::{CResult, Error};
use crate::store::tuple::TR_VERSION_LEN;
use crate::store::{KeyRange, Store, Txn, Watch};

pub struct Memory {
    inner: std::sync::Mutex<Inner>,
}

struct Inner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,

    /// Commit version of the most recently committed transaction.
    version: u64,

    /// Armed watches, each remembering the value it observed when armed.
    watches: Vec<ArmedWatch>,
}

struct ArmedWatch {
    key: Vec<u8>,
    observed: Option<Vec<u8>>,
    signal: oneshot::Sender<()>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            inner: std::sync::Mutex::new(Inner {
                data: BTreeMap::new(),
                version: 0,
                watches: Vec::new(),
            }),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    type Txn<'a> = MemoryTxn<'a>;

    fn transact<T>(&self, mut f: impl FnMut(&mut MemoryTxn<'_>) -> CResult<T>) -> CResult<T> {
        let mut guard = self.inner.lock()?;
        let mut txn = MemoryTxn {
            inner: &mut *guard,
            writes: BTreeMap::new(),
            stamped: Vec::new(),
            watch_reqs: Vec::new(),
        };
        let value = f(&mut txn)?;
        let MemoryTxn { writes, stamped, watch_reqs, .. } = txn;
        guard.commit(writes, stamped, watch_reqs);
        Ok(value)
    }
}

impl Inner {
    fn commit(
        &mut self,
        writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
        stamped: Vec<Stamped>,
        watch_reqs: Vec<(Vec<u8>, oneshot::Sender<()>)>,
    ) {
        self.version += 1;
        let mut stamp = [0u8; TR_VERSION_LEN];
        BigEndian::write_u64(&mut stamp[..8], self.version);

        for (key, write) in writes {
            match write {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        for op in stamped {
            match op {
                Stamped::Key { mut key, offset, value } => {
                    key[offset..offset + TR_VERSION_LEN].copy_from_slice(&stamp);
                    self.data.insert(key, value);
                }
                Stamped::Value { key, mut value, offset } => {
                    value[offset..offset + TR_VERSION_LEN].copy_from_slice(&stamp);
                    self.data.insert(key, value);
                }
            }
        }

        // Fire armed watches whose committed value now differs from what
        // they observed; drop the ones nobody is waiting on any more.
        let armed = std::mem::take(&mut self.watches);
        for watch in armed {
            if watch.signal.is_closed() {
                continue;
            }
            if self.data.get(&watch.key) != watch.observed.as_ref() {
                let _ = watch.signal.send(());
            } else {
                self.watches.push(watch);
            }
        }

        // Arm this transaction's watches against post-commit values.
        for (key, signal) in watch_reqs {
            let observed = self.data.get(&key).cloned();
            self.watches.push(ArmedWatch { key, observed, signal });
        }
    }
}

pub struct MemoryTxn<'a> {
    inner: &'a mut Inner,

    /// Buffered point writes; None is a pending clear.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,

    /// Versionstamped mutations, completed at commit time.
    stamped: Vec<Stamped>,

    /// Watches to arm when this transaction commits.
    watch_reqs: Vec<(Vec<u8>, oneshot::Sender<()>)>,
}

enum Stamped {
    Key { key: Vec<u8>, offset: usize, value: Vec<u8> },
    Value { key: Vec<u8>, value: Vec<u8>, offset: usize },
}

/// Splits a versionstamped buffer into its payload and the stamp offset its
/// trailing 4 little-endian bytes name.
fn split_stamped(buf: &[u8]) -> CResult<(Vec<u8>, usize)> {
    if buf.len() < 4 {
        return Err(Error::Store(
            "versionstamped buffer shorter than its offset suffix".into(),
        ));
    }
    let (payload, tail) = buf.split_at(buf.len() - 4);
    let offset = LittleEndian::read_u32(tail) as usize;
    if offset + TR_VERSION_LEN > payload.len() {
        return Err(Error::Store("versionstamp offset out of bounds".into()));
    }
    Ok((payload.to_vec(), offset))
}

impl<'a> MemoryTxn<'a> {
    fn bounds(range: &KeyRange) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (
            Bound::Included(range.begin.as_slice()),
            Bound::Excluded(range.end.as_slice()),
        )
    }
}

impl<'a> Txn for MemoryTxn<'a> {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some(write) = self.writes.get(key) {
            return Ok(write.clone());
        }
        Ok(self.inner.data.get(key).cloned())
    }

    fn scan(
        &mut self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let bounds = Self::bounds(&range);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .inner
            .data
            .range::<[u8], _>(bounds)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, write) in self.writes.range::<[u8], _>(bounds) {
            match write {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let mut pairs: Vec<_> = merged.into_iter().collect();
        if let Some(limit) = limit {
            pairs.truncate(limit);
        }
        Ok(pairs)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn clear_range(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let bounds = Self::bounds(&range);
        let keys: Vec<Vec<u8>> = self
            .inner
            .data
            .range::<[u8], _>(bounds)
            .map(|(k, _)| k.clone())
            .chain(self.writes.range::<[u8], _>(bounds).map(|(k, _)| k.clone()))
            .collect();
        for key in keys {
            self.writes.insert(key, None);
        }
    }

    fn set_versionstamped_key(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let (key, offset) = split_stamped(key)?;
        self.stamped.push(Stamped::Key { key, offset, value: value.to_vec() });
        Ok(())
    }

    fn set_versionstamped_value(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let (value, offset) = split_stamped(value)?;
        self.stamped.push(Stamped::Value { key: key.to_vec(), value, offset });
        Ok(())
    }

    fn watch(&mut self, key: &[u8]) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.watch_reqs.push((key.to_vec(), tx));
        Watch::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    super::super::tests::test_store!(Memory::new());

    #[tokio::test]
    async fn watch_fires_on_value_change() -> CResult<()> {
        let s = Memory::new();
        s.transact(|txn| {
            txn.set(b"k", &[1]);
            Ok(())
        })?;
        let watch = s.transact(|txn| Ok(txn.watch(b"k")))?;
        s.transact(|txn| {
            txn.set(b"k", &[2]);
            Ok(())
        })?;
        watch.fired().await
    }

    #[tokio::test]
    async fn watch_fires_on_clear() -> CResult<()> {
        let s = Memory::new();
        s.transact(|txn| {
            txn.set(b"k", &[]);
            Ok(())
        })?;
        let watch = s.transact(|txn| Ok(txn.watch(b"k")))?;
        s.transact(|txn| {
            txn.clear(b"k");
            Ok(())
        })?;
        watch.fired().await
    }

    #[tokio::test]
    async fn watch_stays_quiet_on_same_value_rewrite() -> CResult<()> {
        let s = Memory::new();
        s.transact(|txn| {
            txn.set(b"k", &[1]);
            Ok(())
        })?;
        let watch = s.transact(|txn| Ok(txn.watch(b"k")))?;
        s.transact(|txn| {
            txn.set(b"k", &[1]);
            Ok(())
        })?;
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), watch.fired());
        assert!(pending.await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn watch_observes_the_arming_transactions_own_write() -> CResult<()> {
        let s = Memory::new();
        let watch = s.transact(|txn| {
            txn.set(b"k", &[1]);
            Ok(txn.watch(b"k"))
        })?;
        // The arming commit itself must not fire the watch.
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), watch.fired());
        assert!(pending.await.is_err());

        let watch = s.transact(|txn| Ok(txn.watch(b"k")))?;
        s.transact(|txn| {
            txn.set(b"k", &[2]);
            Ok(())
        })?;
        watch.fired().await
    }

    #[tokio::test]
    async fn watch_errors_when_the_store_goes_away() -> CResult<()> {
        let s = Memory::new();
        let watch = s.transact(|txn| Ok(txn.watch(b"k")))?;
        drop(s);
        assert!(matches!(watch.fired().await, Err(Error::Store(_))));
        Ok(())
    }
}
