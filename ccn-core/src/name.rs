//! Hierarchical names and their encoded form.
//!
//! A name is an ordered sequence of opaque byte components. The encoded
//! form (each component as one TLV element, concatenated) doubles as the
//! content-store index key; component boundaries inside a key are
//! recovered once at parse time and carried as an offset array.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packets::types;
use crate::tlv::{self, TlvError};

/// Upper bound on the number of components a message may carry.
pub const MAX_NAME_COMPONENTS: usize = 64;

/// Encoded size of an explicit digest component: type byte, one-byte
/// length, and a 32-byte value.
pub const DIGEST_COMPONENT_WIRE_LEN: usize = 34;

/// One name component: opaque bytes, optionally marked as a content
/// digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component {
    pub typ: u8,
    pub value: Vec<u8>,
}

impl Component {
    pub fn generic(value: Vec<u8>) -> Self {
        Self {
            typ: types::NAME_COMPONENT,
            value,
        }
    }

    pub fn digest(digest: [u8; 32]) -> Self {
        Self {
            typ: types::DIGEST_COMPONENT,
            value: digest.to_vec(),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.typ == types::DIGEST_COMPONENT && self.value.len() == 32
    }
}

/// A hierarchical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Empty segments are skipped.
    pub fn from_uri(path: &str) -> Self {
        let mut name = Name::new();
        for segment in path.split('/') {
            if !segment.is_empty() {
                name.push(segment.as_bytes().to_vec());
            }
        }
        name
    }

    pub fn push(&mut self, value: Vec<u8>) -> &mut Self {
        self.components.push(Component::generic(value));
        self
    }

    pub fn push_digest(&mut self, digest: [u8; 32]) -> &mut Self {
        self.components.push(Component::digest(digest));
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn prefix(&self, count: usize) -> Name {
        Name {
            components: self.components[..count.min(self.components.len())].to_vec(),
        }
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.len() <= other.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }

    /// Flat encoding of the component sequence, used as the index key.
    pub fn encode_components(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_components_into(&mut out);
        out
    }

    /// [`Name::encode_components`] appending to a caller-supplied
    /// buffer.
    pub fn encode_components_into(&self, out: &mut Vec<u8>) {
        for c in &self.components {
            tlv::write_header(out, c.typ, c.value.len());
            out.extend_from_slice(&c.value);
        }
    }

    /// Inverse of [`Name::encode_components`].
    pub fn decode_components(data: &[u8]) -> Result<Self, TlvError> {
        let mut name = Name::new();
        let mut offset = 0;
        while offset < data.len() {
            let (typ, len, header) = tlv::read_header(&data[offset..])?;
            if typ != types::NAME_COMPONENT && typ != types::DIGEST_COMPONENT {
                return Err(TlvError::UnexpectedType(typ));
            }
            if data.len() < offset + header + len {
                return Err(TlvError::Truncated);
            }
            name.components.push(Component {
                typ,
                value: data[offset + header..offset + header + len].to_vec(),
            });
            offset += header + len;
        }
        if name.components.len() > MAX_NAME_COMPONENTS {
            return Err(TlvError::Oversize(name.components.len()));
        }
        Ok(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for c in &self.components {
            write!(f, "/")?;
            if c.is_digest() {
                for b in &c.value {
                    write!(f, "{b:02x}")?;
                }
            } else {
                for &b in &c.value {
                    if b.is_ascii_graphic() || b == b' ' {
                        write!(f, "{}", b as char)?;
                    } else {
                        write!(f, "%{b:02X}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Component start offsets within an encoded key, with one trailing
/// entry at the key's end: a key of `n` components yields `n + 1`
/// offsets.
pub fn component_offsets(key: &[u8]) -> Result<Vec<usize>, TlvError> {
    let mut offsets = Vec::new();
    component_offsets_into(key, &mut offsets)?;
    Ok(offsets)
}

/// [`component_offsets`] writing into a caller-supplied vector.
pub fn component_offsets_into(key: &[u8], offsets: &mut Vec<usize>) -> Result<(), TlvError> {
    offsets.clear();
    let mut offset = 0;
    while offset < key.len() {
        offsets.push(offset);
        let (typ, len, header) = tlv::read_header(&key[offset..])?;
        if typ != types::NAME_COMPONENT && typ != types::DIGEST_COMPONENT {
            return Err(TlvError::UnexpectedType(typ));
        }
        if key.len() < offset + header + len {
            return Err(TlvError::Truncated);
        }
        offset += header + len;
    }
    offsets.push(offset);
    if offsets.len() - 1 > MAX_NAME_COMPONENTS {
        return Err(TlvError::Oversize(offsets.len() - 1));
    }
    Ok(())
}

/// `(type, value)` of the component starting at `offset` in `key`.
/// The caller supplies an offset previously produced by
/// [`component_offsets`].
pub fn component_at(key: &[u8], offset: usize) -> (u8, &[u8]) {
    let (typ, len, header) =
        tlv::read_header(&key[offset..]).expect("offset from component_offsets");
    (typ, &key[offset + header..offset + header + len])
}

/// Canonical component order over two encoded keys: component by
/// component, shorter value first, then value bytes, then component
/// type; a missing component sorts before any present one.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    let mut ia = 0;
    let mut ib = 0;
    loop {
        match (ia < a.len(), ib < b.len()) {
            (false, false) => return Ordering::Equal,
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (true, true) => {}
        }
        let (ta, va) = component_at(a, ia);
        let (tb, vb) = component_at(b, ib);
        let ord = va
            .len()
            .cmp(&vb.len())
            .then_with(|| va.cmp(vb))
            .then_with(|| ta.cmp(&tb));
        if ord != Ordering::Equal {
            return ord;
        }
        ia += 1 + tlv::length_field_size(va.len()) + va.len();
        ib += 1 + tlv::length_field_size(vb.len()) + vb.len();
    }
}

/// Whether the first `count` components of `key` are byte-identical to
/// the whole of `prefix_key` up to its `count`-th boundary.
pub fn key_has_prefix(key: &[u8], prefix_key: &[u8], prefix_offsets: &[usize], count: usize) -> bool {
    debug_assert!(count < prefix_offsets.len());
    let span = prefix_offsets[count];
    key.len() >= span && key[..span] == prefix_key[..span]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let name = Name::from_uri("/x/y/1");
        assert_eq!(name.len(), 3);
        assert_eq!(name.to_string(), "/x/y/1");
    }

    #[test]
    fn encode_offsets_agree() {
        let name = Name::from_uri("/alpha/b/gamma");
        let key = name.encode_components();
        let offsets = component_offsets(&key).unwrap();
        assert_eq!(offsets.len(), 4);
        assert_eq!(*offsets.last().unwrap(), key.len());
        let (_, v) = component_at(&key, offsets[1]);
        assert_eq!(v, b"b");
    }

    #[test]
    fn decode_components_round_trip() {
        let mut name = Name::from_uri("/x/y");
        name.push_digest([7u8; 32]);
        let key = name.encode_components();
        let back = Name::decode_components(&key).unwrap();
        assert_eq!(back, name);
        assert!(back.get(2).unwrap().is_digest());
    }

    #[test]
    fn compare_orders_shorter_component_first() {
        let a = Name::from_uri("/x/ab").encode_components();
        let b = Name::from_uri("/x/b").encode_components();
        // "b" is shorter than "ab", so /x/b sorts first.
        assert_eq!(compare_keys(&a, &b), Ordering::Greater);
        assert_eq!(compare_keys(&b, &a), Ordering::Less);
    }

    #[test]
    fn compare_prefix_sorts_before_extension() {
        let a = Name::from_uri("/x/y").encode_components();
        let b = Name::from_uri("/x/y/1").encode_components();
        assert_eq!(compare_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_keys(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prefix_check() {
        let content = Name::from_uri("/x/y/1").encode_components();
        let prefix = Name::from_uri("/x/y").encode_components();
        let offs = component_offsets(&prefix).unwrap();
        assert!(key_has_prefix(&content, &prefix, &offs, 2));
        let other = Name::from_uri("/x/z").encode_components();
        let offs2 = component_offsets(&other).unwrap();
        assert!(!key_has_prefix(&content, &other, &offs2, 2));
    }

    #[test]
    fn digest_component_wire_len() {
        let mut name = Name::new();
        name.push_digest([0u8; 32]);
        assert_eq!(name.encode_components().len(), DIGEST_COMPONENT_WIRE_LEN);
    }
}
