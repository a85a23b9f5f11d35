//! The store's tuple encoding: an order-preserving, self-delimiting
//! serialization of typed elements. Packing a tuple under a [`Subspace`]
//! prefix yields a key whose lexicographic order matches the logical order of
//! its elements, so prefix ranges scan exactly the intended entries.
//!
//! Only the element shapes the mutex schema persists are supported: byte
//! strings, unicode strings, and 12-byte versionstamps.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{CResult, Error};
use crate::store::KeyRange;

/// Total length of a versionstamp: transaction version plus user version.
pub const VERSIONSTAMP_LEN: usize = 12;

/// Length of the transaction-version part the store fills in at commit time.
pub const TR_VERSION_LEN: usize = 10;

const BYTES_CODE: u8 = 0x01;
const STRING_CODE: u8 = 0x02;
const VERSIONSTAMP_CODE: u8 = 0x33;

/// A 12-byte commit-ordered stamp: a 10-byte transaction version assigned by
/// the store at commit time, followed by a 2-byte big-endian user version. An
/// incomplete stamp carries 0xFF in every transaction-version byte and is
/// completed by the store during commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Versionstamp([u8; VERSIONSTAMP_LEN]);

impl Versionstamp {
    /// An incomplete stamp, to be filled in at commit time.
    pub fn incomplete(user_version: u16) -> Self {
        let mut bytes = [0xFF; VERSIONSTAMP_LEN];
        BigEndian::write_u16(&mut bytes[TR_VERSION_LEN..], user_version);
        Versionstamp(bytes)
    }

    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_LEN]) -> Self {
        Versionstamp(bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.0[..TR_VERSION_LEN].iter().any(|b| *b != 0xFF)
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.0
    }
}

/// A single tuple element.
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Versionstamp(Versionstamp),
}

impl Element {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Element::Bytes(raw) => {
                out.push(BYTES_CODE);
                escape_into(raw, out);
            }
            Element::Str(s) => {
                out.push(STRING_CODE);
                escape_into(s.as_bytes(), out);
            }
            Element::Versionstamp(vs) => {
                out.push(VERSIONSTAMP_CODE);
                out.extend_from_slice(vs.as_bytes());
            }
        }
    }

    /// Decodes one element off the front of input, returning it along with
    /// the number of bytes consumed.
    fn decode(input: &[u8]) -> CResult<(Element, usize)> {
        let code = *input
            .first()
            .ok_or_else(|| Error::DecodingFailed("empty tuple element".into()))?;
        match code {
            BYTES_CODE => {
                let (raw, n) = unescape(&input[1..])?;
                Ok((Element::Bytes(raw), n + 1))
            }
            STRING_CODE => {
                let (raw, n) = unescape(&input[1..])?;
                Ok((Element::Str(String::from_utf8(raw)?), n + 1))
            }
            VERSIONSTAMP_CODE => {
                let rest = &input[1..];
                if rest.len() < VERSIONSTAMP_LEN {
                    return Err(Error::DecodingFailed("truncated versionstamp".into()));
                }
                let mut bytes = [0; VERSIONSTAMP_LEN];
                bytes.copy_from_slice(&rest[..VERSIONSTAMP_LEN]);
                Ok((
                    Element::Versionstamp(Versionstamp::from_bytes(bytes)),
                    VERSIONSTAMP_LEN + 1,
                ))
            }
            other => Err(Error::DecodingFailed(format!(
                "unknown tuple type code {other:#04x}"
            ))),
        }
    }
}

/// Appends content with 0x00 escaped as 0x00 0xFF, then the 0x00 terminator.
/// The escape keeps encodings self-delimiting without breaking byte order.
fn escape_into(content: &[u8], out: &mut Vec<u8>) {
    for &b in content {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

/// Reads an escaped run up to its terminator, returning the content and the
/// number of input bytes consumed (terminator included).
fn unescape(input: &[u8]) -> CResult<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            0x00 if input.get(i + 1) == Some(&0xFF) => {
                out.push(0x00);
                i += 2;
            }
            0x00 => return Ok((out, i + 1)),
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(Error::DecodingFailed("unterminated tuple element".into()))
}

/// A byte prefix under which a component keeps its keys. Packing appends
/// tuple-encoded elements to the prefix; prefix arithmetic yields ranges.
#[derive(Clone, Debug, PartialEq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn from_bytes(prefix: &[u8]) -> Self {
        Subspace { prefix: prefix.to_vec() }
    }

    /// The child subspace obtained by appending one encoded element.
    pub fn subspace(&self, element: &Element) -> Subspace {
        let mut prefix = self.prefix.clone();
        element.encode(&mut prefix);
        Subspace { prefix }
    }

    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut out = self.prefix.clone();
        for element in elements {
            element.encode(&mut out);
        }
        out
    }

    /// Packs a tuple containing exactly one incomplete versionstamp and
    /// appends the 4-byte little-endian offset of its transaction-version
    /// bytes, as the store's versionstamped-key mutation expects.
    pub fn pack_with_versionstamp(&self, elements: &[Element]) -> CResult<Vec<u8>> {
        let mut out = self.prefix.clone();
        let mut offset: Option<u32> = None;
        for element in elements {
            if let Element::Versionstamp(vs) = element {
                if !vs.is_complete() {
                    if offset.is_some() {
                        return Err(Error::Internal(
                            "tuple has more than one incomplete versionstamp".into(),
                        ));
                    }
                    // Skip the type code; the offset names the stamp itself.
                    offset = Some(out.len() as u32 + 1);
                }
            }
            element.encode(&mut out);
        }
        let offset = offset.ok_or_else(|| {
            Error::Internal("tuple has no incomplete versionstamp".into())
        })?;
        let mut tail = [0; 4];
        LittleEndian::write_u32(&mut tail, offset);
        out.extend_from_slice(&tail);
        Ok(out)
    }

    /// Decodes a key back into its elements. Errors when the key does not
    /// extend this subspace's prefix or the remainder is not a valid tuple.
    pub fn unpack(&self, key: &[u8]) -> CResult<Vec<Element>> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            Error::DecodingFailed("key does not extend this subspace".into())
        })?;
        let mut elements = Vec::new();
        let mut i = 0;
        while i < rest.len() {
            let (element, n) = Element::decode(&rest[i..])?;
            elements.push(element);
            i += n;
        }
        Ok(elements)
    }

    /// The range covering every key packed under this subspace. Element
    /// encodings start with a type code strictly between 0x00 and 0xFF, so
    /// the bracket is exact.
    pub fn range(&self) -> KeyRange {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xFF);
        KeyRange::new(begin, end)
    }
}
