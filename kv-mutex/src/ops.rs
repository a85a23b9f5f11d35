//! Transactional primitives over the schema. Each public function here runs
//! as a single store transaction, relying on the store's conflict retry; the
//! [`tx`] module exposes the transaction-scoped bodies for callers that
//! compose several of them into one transaction (release promotes the queue
//! head and installs it as owner atomically, for example).

use crate::error::CResult;
use crate::schema::Schema;
use crate::store::{Store, Txn, Watch};

/// The owner record: the current holder's name and its latest heartbeat
/// stamp. An empty name is the unowned sentinel; an empty stamp means no
/// heartbeat yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Owner {
    pub name: String,
    pub hbeat: Vec<u8>,
}

pub fn set_owner<S: Store>(store: &S, schema: &Schema, name: &str) -> CResult<()> {
    store.transact(|txn| tx::set_owner(txn, schema, name))
}

pub fn get_owner<S: Store>(store: &S, schema: &Schema) -> CResult<Owner> {
    store.transact(|txn| tx::get_owner(txn, schema))
}

/// Reads the current owner and registers a watch on that exact key, all in
/// one transaction, so no transition can slip between the read and the
/// registration. The watch fires once, when the key is modified or cleared.
pub fn watch_owner<S: Store>(store: &S, schema: &Schema) -> CResult<Watch> {
    store.transact(|txn| {
        let owner = tx::get_owner(txn, schema)?;
        Ok(txn.watch(&schema.owner_key(&owner.name)))
    })
}

pub fn heartbeat<S: Store>(store: &S, schema: &Schema, name: &str) -> CResult<()> {
    if name.is_empty() {
        return Ok(());
    }
    store.transact(|txn| tx::heartbeat(txn, schema, name))
}

pub fn enqueue<S: Store>(store: &S, schema: &Schema, name: &str) -> CResult<()> {
    store.transact(|txn| tx::enqueue(txn, schema, name))
}

pub fn dequeue<S: Store>(store: &S, schema: &Schema) -> CResult<String> {
    store.transact(|txn| tx::dequeue(txn, schema))
}

pub(crate) mod tx {
    use super::Owner;
    use crate::error::CResult;
    use crate::schema::Schema;
    use crate::store::Txn;

    /// Installs name as the owner, clearing whichever owner came before, so
    /// the owner range never holds more than one key.
    pub fn set_owner(txn: &mut impl Txn, schema: &Schema, name: &str) -> CResult<()> {
        txn.clear_range(schema.owner_range());
        txn.set(&schema.owner_key(name), &[]);
        Ok(())
    }

    pub fn get_owner(txn: &mut impl Txn, schema: &Schema) -> CResult<Owner> {
        let mut pairs = txn.scan(schema.owner_range(), Some(1))?;
        let Some((key, hbeat)) = pairs.pop() else {
            return Ok(Owner::default());
        };
        Ok(Owner { name: schema.unpack_owner_key(&key)?, hbeat })
    }

    /// Bumps the owner's heartbeat stamp, but only while name still holds
    /// the lock; a stale heartbeat from a released client must not write.
    pub fn heartbeat(txn: &mut impl Txn, schema: &Schema, name: &str) -> CResult<()> {
        if name.is_empty() {
            return Ok(());
        }
        let owner = get_owner(txn, schema)?;
        if owner.name != name {
            return Ok(());
        }
        txn.set_versionstamped_value(&schema.owner_key(name), &schema.owner_value())
    }

    /// Appends name to the wait queue unless it is already in it, so
    /// retried enqueues never duplicate an entry.
    pub fn enqueue(txn: &mut impl Txn, schema: &Schema, name: &str) -> CResult<()> {
        for (_, value) in txn.scan(schema.queue_range(), None)? {
            if value == name.as_bytes() {
                return Ok(());
            }
        }
        txn.set_versionstamped_key(&schema.queue_key()?, &schema.queue_value(name))
    }

    /// Removes and returns the queue head, or "" when nobody waits. A
    /// caller promoting the head to owner does so in this same transaction.
    pub fn dequeue(txn: &mut impl Txn, schema: &Schema) -> CResult<String> {
        let mut pairs = txn.scan(schema.queue_range(), Some(1))?;
        let Some((key, value)) = pairs.pop() else {
            return Ok(String::new());
        };
        txn.clear(&key);
        schema.unpack_queue_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::Error;
    use crate::store::memory::Memory;
    use crate::store::tuple::{Element, Subspace, VERSIONSTAMP_LEN};

    fn setup() -> (Memory, Schema) {
        (Memory::new(), Schema::new(Subspace::from_bytes(b"mx")))
    }

    #[test]
    fn set_owner_keeps_a_single_record() -> CResult<()> {
        let (store, schema) = setup();
        set_owner(&store, &schema, "a")?;
        set_owner(&store, &schema, "b")?;

        let pairs = store.transact(|txn| txn.scan(schema.owner_range(), None))?;
        assert_eq!(pairs.len(), 1);
        assert_eq!(get_owner(&store, &schema)?, Owner { name: "b".into(), hbeat: vec![] });
        Ok(())
    }

    #[test]
    fn get_owner_defaults_when_unowned() -> CResult<()> {
        let (store, schema) = setup();
        assert_eq!(get_owner(&store, &schema)?, Owner::default());
        Ok(())
    }

    #[test]
    fn heartbeat_ignores_non_owner() -> CResult<()> {
        let (store, schema) = setup();
        set_owner(&store, &schema, "A")?;
        heartbeat(&store, &schema, "Z")?;
        assert_eq!(get_owner(&store, &schema)?.hbeat, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn heartbeat_stamps_increase() -> CResult<()> {
        let (store, schema) = setup();
        set_owner(&store, &schema, "A")?;
        heartbeat(&store, &schema, "A")?;
        let first = get_owner(&store, &schema)?.hbeat;
        heartbeat(&store, &schema, "A")?;
        let second = get_owner(&store, &schema)?.hbeat;

        assert_eq!(first.len(), VERSIONSTAMP_LEN);
        assert!(second > first);
        Ok(())
    }

    #[test]
    fn heartbeat_without_a_name_is_a_noop() -> CResult<()> {
        let (store, schema) = setup();
        heartbeat(&store, &schema, "")?;
        assert_eq!(get_owner(&store, &schema)?, Owner::default());
        Ok(())
    }

    #[test]
    fn enqueue_is_idempotent() -> CResult<()> {
        let (store, schema) = setup();
        enqueue(&store, &schema, "n")?;
        enqueue(&store, &schema, "n")?;

        let pairs = store.transact(|txn| txn.scan(schema.queue_range(), None))?;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, b"n".to_vec());
        Ok(())
    }

    #[test]
    fn queue_is_fifo_by_commit_not_by_name() -> CResult<()> {
        let (store, schema) = setup();
        enqueue(&store, &schema, "Z")?;
        enqueue(&store, &schema, "A")?;

        assert_eq!(dequeue(&store, &schema)?, "Z");
        assert_eq!(dequeue(&store, &schema)?, "A");
        assert_eq!(dequeue(&store, &schema)?, "");
        Ok(())
    }

    #[test]
    fn dequeue_on_empty_queue_removes_nothing() -> CResult<()> {
        let (store, schema) = setup();
        assert_eq!(dequeue(&store, &schema)?, "");
        let pairs = store.transact(|txn| txn.scan(schema.queue_range(), None))?;
        assert_eq!(pairs, vec![]);
        Ok(())
    }

    #[tokio::test]
    async fn watch_owner_fires_on_owner_change() -> CResult<()> {
        let (store, schema) = setup();
        set_owner(&store, &schema, "A")?;
        let watch = watch_owner(&store, &schema)?;
        set_owner(&store, &schema, "B")?;
        watch.fired().await
    }

    #[tokio::test]
    async fn watch_owner_sees_the_first_acquire_after_init() -> CResult<()> {
        let (store, schema) = setup();
        // The unowned sentinel gives the watch a real key to follow.
        set_owner(&store, &schema, "")?;
        let watch = watch_owner(&store, &schema)?;
        set_owner(&store, &schema, "c")?;
        watch.fired().await
    }

    #[test]
    fn foreign_bytes_under_the_owner_range_error() {
        let (store, schema) = setup();
        let root = Subspace::from_bytes(b"mx");
        let junk = root.pack(&[Element::Str("owner".into()), Element::Bytes(vec![7])]);
        store
            .transact(|txn| {
                txn.set(&junk, &[]);
                Ok(())
            })
            .expect("raw write failed");

        assert!(matches!(
            get_owner(&store, &schema),
            Err(Error::DecodingFailed(_))
        ));
    }
}
