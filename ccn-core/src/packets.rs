//! Interest and ContentObject messages.
//!
//! The forwarder handles exactly two message kinds. Both are a single
//! outer TLV element whose value is a sequence of inner elements in
//! canonical order; unknown inner elements are skipped on decode.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bloom::Bloom;
use crate::name::{self, Name};
use crate::tlv::{self, TlvElement, TlvError};

/// Wire type constants.
pub mod types {
    /// Outer link envelope wrapping one message on framed faces.
    pub const PROTOCOL_DATA_UNIT: u8 = 0x04;
    pub const INTEREST: u8 = 0x05;
    pub const CONTENT_OBJECT: u8 = 0x06;
    pub const NAME: u8 = 0x07;
    pub const NAME_COMPONENT: u8 = 0x08;
    pub const DIGEST_COMPONENT: u8 = 0x01;
    pub const NONCE: u8 = 0x0A;
    pub const MIN_SUFFIX_COMPONENTS: u8 = 0x0D;
    pub const MAX_SUFFIX_COMPONENTS: u8 = 0x0E;
    pub const PUBLISHER_DIGEST: u8 = 0x0F;
    pub const EXCLUDE: u8 = 0x10;
    pub const ORDER_PREFERENCE: u8 = 0x11;
    pub const EXCLUDE_ANY: u8 = 0x13;
    pub const CONTENT: u8 = 0x15;
    pub const SIGNATURE: u8 = 0x16;
    pub const SCOPE: u8 = 0x1E;
    pub const RESPONSE_FILTER: u8 = 0x20;
}

/// Ordering preference asking for the largest matching name.
pub const ORDER_PREF_RIGHTMOST: u8 = 5;

/// Nonces synthesized by the forwarder are this long.
pub const NONCE_LEN: usize = 6;

/// Canonical position of an inner element within an Interest.
fn interest_rank(typ: u8) -> u8 {
    match typ {
        types::NAME => 0,
        types::MIN_SUFFIX_COMPONENTS => 1,
        types::MAX_SUFFIX_COMPONENTS => 2,
        types::PUBLISHER_DIGEST => 3,
        types::EXCLUDE => 4,
        types::ORDER_PREFERENCE => 5,
        types::SCOPE => 6,
        types::NONCE => 7,
        types::RESPONSE_FILTER => 8,
        _ => u8::MAX,
    }
}

fn encode_number(mut n: u64) -> Vec<u8> {
    if n == 0 {
        return vec![0];
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push((n & 0xFF) as u8);
        n >>= 8;
    }
    out.reverse();
    out
}

fn decode_number(data: &[u8]) -> u64 {
    data.iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// An exclude filter: an ordered sequence of components with optional
/// `Any` gaps covering the open ranges between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExcludeEntry {
    Component(Vec<u8>),
    Any,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclude {
    pub entries: Vec<ExcludeEntry>,
}

impl Exclude {
    /// Whether `value` falls inside the filter. Component order here is
    /// the same canonical order names sort by: shorter first, then
    /// bytes.
    pub fn excludes(&self, value: &[u8]) -> bool {
        use std::cmp::Ordering;
        let mut any_open = false;
        for entry in &self.entries {
            match entry {
                ExcludeEntry::Any => any_open = true,
                ExcludeEntry::Component(c) => {
                    let ord = value
                        .len()
                        .cmp(&c.len())
                        .then_with(|| value.as_ref().cmp(c.as_slice()));
                    match ord {
                        Ordering::Equal => return true,
                        Ordering::Less => return any_open,
                        Ordering::Greater => any_open = false,
                    }
                }
            }
        }
        any_open
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            match entry {
                ExcludeEntry::Any => tlv::write_header(&mut out, types::EXCLUDE_ANY, 0),
                ExcludeEntry::Component(c) => {
                    tlv::write_header(&mut out, types::NAME_COMPONENT, c.len());
                    out.extend_from_slice(c);
                }
            }
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut entries = Vec::new();
        for el in TlvElement::decode_all(data)? {
            match el.typ {
                types::EXCLUDE_ANY => entries.push(ExcludeEntry::Any),
                types::NAME_COMPONENT | types::DIGEST_COMPONENT => {
                    entries.push(ExcludeEntry::Component(el.value))
                }
                other => return Err(TlvError::UnexpectedType(other)),
            }
        }
        Ok(Self { entries })
    }
}

/// A subscription for content under a name prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interest {
    pub name: Name,
    pub min_suffix_components: Option<u32>,
    pub max_suffix_components: Option<u32>,
    pub publisher_digest: Option<Vec<u8>>,
    pub exclude: Option<Exclude>,
    pub order_preference: Option<u8>,
    pub scope: Option<u8>,
    pub nonce: Option<Vec<u8>>,
    pub response_filter: Option<Bloom>,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: u8) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_nonce(mut self, nonce: Vec<u8>) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_order_preference(mut self, pref: u8) -> Self {
        self.order_preference = Some(pref);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::new();
        let key = self.name.encode_components();
        tlv::write_header(&mut inner, types::NAME, key.len());
        inner.extend_from_slice(&key);
        if let Some(n) = self.min_suffix_components {
            let v = encode_number(n as u64);
            tlv::write_header(&mut inner, types::MIN_SUFFIX_COMPONENTS, v.len());
            inner.extend_from_slice(&v);
        }
        if let Some(n) = self.max_suffix_components {
            let v = encode_number(n as u64);
            tlv::write_header(&mut inner, types::MAX_SUFFIX_COMPONENTS, v.len());
            inner.extend_from_slice(&v);
        }
        if let Some(p) = &self.publisher_digest {
            tlv::write_header(&mut inner, types::PUBLISHER_DIGEST, p.len());
            inner.extend_from_slice(p);
        }
        if let Some(x) = &self.exclude {
            let v = x.encode();
            tlv::write_header(&mut inner, types::EXCLUDE, v.len());
            inner.extend_from_slice(&v);
        }
        if let Some(p) = self.order_preference {
            tlv::write_header(&mut inner, types::ORDER_PREFERENCE, 1);
            inner.push(p);
        }
        if let Some(s) = self.scope {
            tlv::write_header(&mut inner, types::SCOPE, 1);
            inner.push(s);
        }
        if let Some(n) = &self.nonce {
            tlv::write_header(&mut inner, types::NONCE, n.len());
            inner.extend_from_slice(n);
        }
        if let Some(f) = &self.response_filter {
            let v = f.to_wire();
            tlv::write_header(&mut inner, types::RESPONSE_FILTER, v.len());
            inner.extend_from_slice(&v);
        }
        TlvElement::new(types::INTEREST, inner).encode()
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), TlvError> {
        let (outer, used) = TlvElement::decode(data)?;
        if outer.typ != types::INTEREST {
            return Err(TlvError::UnexpectedType(outer.typ));
        }
        let mut interest = Interest::default();
        let mut have_name = false;
        for el in TlvElement::decode_all(&outer.value)? {
            match el.typ {
                types::NAME => {
                    interest.name = Name::decode_components(&el.value)?;
                    have_name = true;
                }
                types::MIN_SUFFIX_COMPONENTS => {
                    interest.min_suffix_components = Some(decode_number(&el.value) as u32)
                }
                types::MAX_SUFFIX_COMPONENTS => {
                    interest.max_suffix_components = Some(decode_number(&el.value) as u32)
                }
                types::PUBLISHER_DIGEST => interest.publisher_digest = Some(el.value),
                types::EXCLUDE => interest.exclude = Some(Exclude::decode(&el.value)?),
                types::ORDER_PREFERENCE => {
                    interest.order_preference = el.value.first().copied()
                }
                types::SCOPE => interest.scope = el.value.first().copied(),
                types::NONCE => interest.nonce = Some(el.value),
                types::RESPONSE_FILTER => {
                    interest.response_filter = Some(Bloom::from_wire(&el.value)?)
                }
                _ => {}
            }
        }
        if !have_name {
            return Err(TlvError::UnexpectedType(types::NAME));
        }
        Ok((interest, used))
    }

    /// Splice a nonce element into an encoded Interest at its canonical
    /// position, rebuilding the outer header. The input must not
    /// already carry a nonce.
    pub fn splice_nonce(msg: &[u8], nonce: &[u8]) -> Result<Vec<u8>, TlvError> {
        let (typ, body_len, header) = tlv::read_header(msg)?;
        if typ != types::INTEREST {
            return Err(TlvError::UnexpectedType(typ));
        }
        if msg.len() < header + body_len {
            return Err(TlvError::Truncated);
        }
        let body = &msg[header..header + body_len];
        let mut insert_at = body.len();
        let mut offset = 0;
        while offset < body.len() {
            let (el_typ, el_len, el_header) = tlv::read_header(&body[offset..])?;
            if interest_rank(el_typ) > interest_rank(types::NONCE) {
                insert_at = offset;
                break;
            }
            offset += el_header + el_len;
        }
        let mut nonce_el = Vec::with_capacity(2 + nonce.len());
        tlv::write_header(&mut nonce_el, types::NONCE, nonce.len());
        nonce_el.extend_from_slice(nonce);

        let mut out = Vec::with_capacity(msg.len() + nonce_el.len());
        tlv::write_header(&mut out, types::INTEREST, body_len + nonce_el.len());
        out.extend_from_slice(&body[..insert_at]);
        out.extend_from_slice(&nonce_el);
        out.extend_from_slice(&body[insert_at..]);
        Ok(out)
    }

    /// Selector checks beyond the prefix match: suffix-component
    /// bounds, the exclude filter against the first post-prefix
    /// component, and the publisher digest.
    pub fn selectors_match(&self, content: &ParsedContent) -> bool {
        self.selectors_match_parts(&content.key, &content.comps, content.publisher.as_deref())
    }

    /// [`Interest::selectors_match`] over raw index parts, for callers
    /// holding a stored entry rather than a [`ParsedContent`].
    pub fn selectors_match_parts(
        &self,
        key: &[u8],
        comps: &[usize],
        publisher: Option<&[u8]>,
    ) -> bool {
        let p = self.name.len();
        let ncomps = comps.len() - 1;
        let suffix = ncomps.saturating_sub(p) as u32;
        if let Some(min) = self.min_suffix_components {
            if suffix < min {
                return false;
            }
        }
        if let Some(max) = self.max_suffix_components {
            if suffix > max {
                return false;
            }
        }
        if let Some(x) = &self.exclude {
            if ncomps > p {
                let (_, value) = name::component_at(key, comps[p]);
                if x.excludes(value) {
                    return false;
                }
            }
        }
        if let Some(pubkey) = &self.publisher_digest {
            match publisher {
                Some(actual) if actual == pubkey.as_slice() => {}
                _ => return false,
            }
        }
        true
    }
}

/// A named payload with an opaque signature digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentObject {
    pub name: Name,
    pub signature: Vec<u8>,
    pub publisher_digest: Option<Vec<u8>>,
    pub content: Vec<u8>,
}

impl ContentObject {
    pub fn new(name: Name, signature: Vec<u8>, content: Vec<u8>) -> Self {
        Self {
            name,
            signature,
            publisher_digest: None,
            content,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::new();
        let key = self.name.encode_components();
        tlv::write_header(&mut inner, types::NAME, key.len());
        inner.extend_from_slice(&key);
        tlv::write_header(&mut inner, types::SIGNATURE, self.signature.len());
        inner.extend_from_slice(&self.signature);
        if let Some(p) = &self.publisher_digest {
            tlv::write_header(&mut inner, types::PUBLISHER_DIGEST, p.len());
            inner.extend_from_slice(p);
        }
        tlv::write_header(&mut inner, types::CONTENT, self.content.len());
        inner.extend_from_slice(&self.content);
        TlvElement::new(types::CONTENT_OBJECT, inner).encode()
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), TlvError> {
        let (outer, used) = TlvElement::decode(data)?;
        if outer.typ != types::CONTENT_OBJECT {
            return Err(TlvError::UnexpectedType(outer.typ));
        }
        let mut co = ContentObject::default();
        let mut have_name = false;
        for el in TlvElement::decode_all(&outer.value)? {
            match el.typ {
                types::NAME => {
                    co.name = Name::decode_components(&el.value)?;
                    have_name = true;
                }
                types::SIGNATURE => co.signature = el.value,
                types::PUBLISHER_DIGEST => co.publisher_digest = Some(el.value),
                types::CONTENT => co.content = el.value,
                _ => {}
            }
        }
        if !have_name {
            return Err(TlvError::UnexpectedType(types::NAME));
        }
        Ok((co, used))
    }

    /// Digest naming this exact message: SHA-256 over the encoded
    /// bytes. This is what an explicit digest name component refers to.
    pub fn implicit_digest(msg: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(msg);
        hasher.finalize().into()
    }
}

/// Offsets into an encoded ContentObject that the forwarder needs
/// without re-decoding: the index key (encoded name components), its
/// component boundaries, and where the signature digest sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContent {
    pub key: Vec<u8>,
    pub comps: Vec<usize>,
    pub sig_offset: usize,
    pub sig_len: usize,
    pub publisher: Option<Vec<u8>>,
}

impl ParsedContent {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    /// The 32-byte signature digest, when the message carries one.
    pub fn signature_digest(&self, msg: &[u8]) -> Option<[u8; 32]> {
        if self.sig_len != 32 {
            return None;
        }
        msg.get(self.sig_offset..self.sig_offset + 32)?
            .try_into()
            .ok()
    }
}

/// Parse an encoded ContentObject into index offsets.
pub fn parse_content(msg: &[u8]) -> Result<ParsedContent, TlvError> {
    let (typ, body_len, outer_header) = tlv::read_header(msg)?;
    if typ != types::CONTENT_OBJECT {
        return Err(TlvError::UnexpectedType(typ));
    }
    if msg.len() < outer_header + body_len {
        return Err(TlvError::Truncated);
    }
    let mut key = None;
    let mut sig = None;
    let mut publisher = None;
    let mut offset = outer_header;
    let end = outer_header + body_len;
    while offset < end {
        let (el_typ, el_len, el_header) = tlv::read_header(&msg[offset..end])?;
        let value_at = offset + el_header;
        if value_at + el_len > end {
            return Err(TlvError::Truncated);
        }
        match el_typ {
            types::NAME => key = Some(msg[value_at..value_at + el_len].to_vec()),
            types::SIGNATURE => sig = Some((value_at, el_len)),
            types::PUBLISHER_DIGEST => {
                publisher = Some(msg[value_at..value_at + el_len].to_vec())
            }
            _ => {}
        }
        offset = value_at + el_len;
    }
    let key = key.ok_or(TlvError::UnexpectedType(types::NAME))?;
    let (sig_offset, sig_len) = sig.ok_or(TlvError::UnexpectedType(types::SIGNATURE))?;
    let comps = name::component_offsets(&key)?;
    Ok(ParsedContent {
        key,
        comps,
        sig_offset,
        sig_len,
        publisher,
    })
}

/// Fixed-width big-endian segment-number component value.
pub fn segment_component(segment: u64) -> Vec<u8> {
    segment.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(name: &str, content: &[u8]) -> ContentObject {
        let mut hasher = Sha256::new();
        hasher.update(content);
        ContentObject::new(
            Name::from_uri(name),
            hasher.finalize().to_vec(),
            content.to_vec(),
        )
    }

    #[test]
    fn interest_round_trip() {
        let interest = Interest::new(Name::from_uri("/x/y"))
            .with_scope(1)
            .with_nonce(vec![1, 2, 3, 4, 5, 6])
            .with_order_preference(ORDER_PREF_RIGHTMOST);
        let wire = interest.encode();
        let (back, used) = Interest::decode(&wire).unwrap();
        assert_eq!(back, interest);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn content_round_trip() {
        let co = signed("/x/y/1", b"payload");
        let wire = co.encode();
        let (back, used) = ContentObject::decode(&wire).unwrap();
        assert_eq!(back, co);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn parse_content_offsets() {
        let co = signed("/x/y/1", b"payload");
        let wire = co.encode();
        let parsed = parse_content(&wire).unwrap();
        assert_eq!(parsed.ncomps(), 3);
        assert_eq!(parsed.key, co.name.encode_components());
        assert_eq!(
            parsed.signature_digest(&wire).unwrap().to_vec(),
            co.signature
        );
    }

    #[test]
    fn splice_nonce_lands_in_canonical_slot() {
        let mut interest = Interest::new(Name::from_uri("/x/y")).with_scope(2);
        interest.response_filter = Some(Bloom::new(8, 3));
        let wire = interest.encode();
        let spliced = Interest::splice_nonce(&wire, &[9, 9, 9, 9, 9, 9]).unwrap();
        let (back, _) = Interest::decode(&spliced).unwrap();
        assert_eq!(back.nonce.as_deref(), Some(&[9u8, 9, 9, 9, 9, 9][..]));
        assert_eq!(back.scope, Some(2));
        assert!(back.response_filter.is_some());
        // The nonce sits after scope and before the response filter.
        let want = {
            let mut i = interest.clone();
            i.nonce = Some(vec![9, 9, 9, 9, 9, 9]);
            i.encode()
        };
        assert_eq!(spliced, want);
    }

    #[test]
    fn exclude_ranges() {
        let x = Exclude {
            entries: vec![
                ExcludeEntry::Component(b"b".to_vec()),
                ExcludeEntry::Any,
                ExcludeEntry::Component(b"f".to_vec()),
            ],
        };
        assert!(x.excludes(b"b"));
        assert!(x.excludes(b"d"));
        assert!(x.excludes(b"f"));
        assert!(!x.excludes(b"a"));
        assert!(!x.excludes(b"g"));
    }

    #[test]
    fn exclude_trailing_any() {
        let x = Exclude {
            entries: vec![
                ExcludeEntry::Component(b"m".to_vec()),
                ExcludeEntry::Any,
            ],
        };
        assert!(!x.excludes(b"a"));
        assert!(x.excludes(b"z"));
    }

    #[test]
    fn suffix_component_bounds() {
        let co = signed("/x/y/1", b"p");
        let wire = co.encode();
        let parsed = parse_content(&wire).unwrap();

        let mut interest = Interest::new(Name::from_uri("/x/y"));
        interest.min_suffix_components = Some(1);
        assert!(interest.selectors_match(&parsed));
        interest.min_suffix_components = Some(2);
        assert!(!interest.selectors_match(&parsed));
        interest.min_suffix_components = None;
        interest.max_suffix_components = Some(0);
        assert!(!interest.selectors_match(&parsed));
    }

    #[test]
    fn exclude_applies_to_next_component() {
        let co = signed("/x/y/1", b"p");
        let wire = co.encode();
        let parsed = parse_content(&wire).unwrap();
        let mut interest = Interest::new(Name::from_uri("/x/y"));
        interest.exclude = Some(Exclude {
            entries: vec![ExcludeEntry::Component(b"1".to_vec())],
        });
        assert!(!interest.selectors_match(&parsed));
    }

    #[test]
    fn publisher_digest_must_agree() {
        let mut co = signed("/x/y/1", b"p");
        co.publisher_digest = Some(vec![7; 32]);
        let wire = co.encode();
        let parsed = parse_content(&wire).unwrap();
        let mut interest = Interest::new(Name::from_uri("/x/y"));
        interest.publisher_digest = Some(vec![7; 32]);
        assert!(interest.selectors_match(&parsed));
        interest.publisher_digest = Some(vec![8; 32]);
        assert!(!interest.selectors_match(&parsed));
    }

    #[test]
    fn segment_component_is_big_endian() {
        assert_eq!(segment_component(1), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
