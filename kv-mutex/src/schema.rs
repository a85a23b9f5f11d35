//! Key layout for one mutex instance under its root subspace. Everything the
//! upper layers read or write in the store goes through these packers:
//!
//! - owner record: `R / "owner" / <name:string>` holding the heartbeat stamp
//!   (or nothing, before the first heartbeat);
//! - queue entry: `R / "queue" / <versionstamp>` holding the waiter's name,
//!   keyed by commit stamp so ascending key order is FIFO commit order.

use crate::error::{CResult, Error};
use crate::store::tuple::{Element, Subspace, Versionstamp, VERSIONSTAMP_LEN};
use crate::store::KeyRange;

const OWNER: &str = "owner";
const QUEUE: &str = "queue";

#[derive(Clone, Debug)]
pub struct Schema {
    root: Subspace,
    owner: Subspace,
    queue: Subspace,
}

impl Schema {
    pub fn new(root: Subspace) -> Self {
        let owner = root.subspace(&Element::Str(OWNER.into()));
        let queue = root.subspace(&Element::Str(QUEUE.into()));
        Schema { root, owner, queue }
    }

    /// Range covering every owner record; it holds at most one key.
    pub fn owner_range(&self) -> KeyRange {
        self.owner.range()
    }

    pub fn owner_key(&self, name: &str) -> Vec<u8> {
        self.owner.pack(&[Element::Str(name.into())])
    }

    /// Decodes the owner name out of an owner-range key. The leading
    /// `"owner"` element is not re-validated; the range already vouches
    /// for it.
    pub fn unpack_owner_key(&self, key: &[u8]) -> CResult<String> {
        let elements = self.root.unpack(key)?;
        if elements.len() != 2 {
            return Err(Error::DecodingFailed(format!(
                "owner key holds {} tuple elements, expected 2",
                elements.len()
            )));
        }
        match elements.into_iter().nth(1) {
            Some(Element::Str(name)) => Ok(name),
            _ => Err(Error::DecodingFailed(
                "owner key does not end in a string".into(),
            )),
        }
    }

    /// Value buffer for a heartbeat write: a stamp-sized placeholder plus
    /// the little-endian offset suffix pointing at its start. The committed
    /// value is the bare 12-byte versionstamp.
    pub fn owner_value(&self) -> Vec<u8> {
        vec![0; VERSIONSTAMP_LEN + 4]
    }

    pub fn queue_range(&self) -> KeyRange {
        self.queue.range()
    }

    /// Key buffer for one queue entry, stamped at commit time.
    pub fn queue_key(&self) -> CResult<Vec<u8>> {
        self.queue
            .pack_with_versionstamp(&[Element::Versionstamp(Versionstamp::incomplete(0))])
    }

    pub fn queue_value(&self, name: &str) -> Vec<u8> {
        name.as_bytes().to_vec()
    }

    pub fn unpack_queue_value(&self, value: &[u8]) -> CResult<String> {
        Ok(String::from_utf8(value.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::store::tuple::TR_VERSION_LEN;

    fn schema() -> Schema {
        Schema::new(Subspace::from_bytes(b"mx"))
    }

    #[test]
    fn owner_keys_round_trip() -> CResult<()> {
        let s = schema();
        for name in ["", "a", "worker-17", "0d5a1b3c"] {
            let key = s.owner_key(name);
            assert!(s.owner_range().contains(&key));
            assert!(!s.queue_range().contains(&key));
            assert_eq!(s.unpack_owner_key(&key)?, name);
        }
        Ok(())
    }

    #[test]
    fn queue_values_round_trip() -> CResult<()> {
        let s = schema();
        for name in ["", "b", "some-client"] {
            assert_eq!(s.unpack_queue_value(&s.queue_value(name))?, name);
        }
        Ok(())
    }

    #[test]
    fn owner_key_decode_rejects_foreign_shapes() {
        let s = schema();
        let root = Subspace::from_bytes(b"mx");

        // Wrong arity.
        let short = root.pack(&[Element::Str(OWNER.into())]);
        assert!(s.unpack_owner_key(&short).is_err());
        let long = root.pack(&[
            Element::Str(OWNER.into()),
            Element::Str("a".into()),
            Element::Str("b".into()),
        ]);
        assert!(s.unpack_owner_key(&long).is_err());

        // Second element is not a string.
        let bytes = root.pack(&[Element::Str(OWNER.into()), Element::Bytes(vec![1, 2])]);
        assert!(s.unpack_owner_key(&bytes).is_err());

        // Key from under somebody else's subspace.
        let foreign = Subspace::from_bytes(b"zz")
            .pack(&[Element::Str(OWNER.into()), Element::Str("a".into())]);
        assert!(s.unpack_owner_key(&foreign).is_err());
    }

    #[test]
    fn owner_value_is_a_stamp_placeholder_with_zero_offset() {
        let value = schema().owner_value();
        assert_eq!(value.len(), VERSIONSTAMP_LEN + 4);
        assert_eq!(LittleEndian::read_u32(&value[VERSIONSTAMP_LEN..]), 0);
    }

    #[test]
    fn queue_keys_carry_an_incomplete_stamp() -> CResult<()> {
        let s = schema();
        let buf = s.queue_key()?;
        let (key, tail) = buf.split_at(buf.len() - 4);
        let offset = LittleEndian::read_u32(tail) as usize;
        assert_eq!(&key[offset..offset + TR_VERSION_LEN], &[0xFF; TR_VERSION_LEN]);
        assert!(s.queue_range().contains(key));
        Ok(())
    }

    #[test]
    fn stamped_queue_keys_decode_and_sort_by_stamp() -> CResult<()> {
        let s = schema();
        let root = Subspace::from_bytes(b"mx");

        let stamped = |version: u8| {
            let mut bytes = [0; VERSIONSTAMP_LEN];
            bytes[7] = version;
            root.pack(&[
                Element::Str(QUEUE.into()),
                Element::Versionstamp(Versionstamp::from_bytes(bytes)),
            ])
        };
        let first = stamped(1);
        let second = stamped(2);
        assert!(first < second);
        assert!(s.queue_range().contains(&first));
        match root.unpack(&first)?.pop() {
            Some(Element::Versionstamp(vs)) => assert!(vs.is_complete()),
            other => panic!("unexpected element: {other:?}"),
        }
        Ok(())
    }
}
