//! Message framing: splitting a byte stream into self-delimiting
//! messages.
//!
//! A sliding decoder accumulates received bytes and yields complete
//! top-level elements. An outer link envelope is recognized and
//! unwrapped one level deep; its presence is reported so the face can
//! be marked link-framed. Nested envelopes are refused.

use ccn_core::packets::types;
use ccn_core::tlv::{self, TlvError};

/// Framing failures. On a stream face any of these tears the face
/// down; on a datagram face the buffer is discarded instead.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("bad element: {0}")]
    Element(#[from] TlvError),
    #[error("nested link envelope")]
    NestedEnvelope,
    #[error("unrecognized message type {0:#04x}")]
    UnknownMessage(u8),
}

/// One extracted message, with a note of whether it arrived inside a
/// link envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub bytes: Vec<u8>,
    pub from_envelope: bool,
}

#[derive(Debug, Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
    // Remaining body of an envelope currently being drained.
    pending: Vec<FramedMessage>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all accumulated state (datagram error recovery).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending.clear();
    }

    /// Extract the next complete message, if one is available.
    pub fn next_message(&mut self) -> Result<Option<FramedMessage>, FramingError> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.remove(0)));
        }
        let span = match tlv::element_span(&self.buf)? {
            Some(span) if span <= self.buf.len() => span,
            _ => return Ok(None),
        };
        let element: Vec<u8> = self.buf.drain(..span).collect();
        match element[0] {
            types::INTEREST | types::CONTENT_OBJECT => Ok(Some(FramedMessage {
                bytes: element,
                from_envelope: false,
            })),
            types::PROTOCOL_DATA_UNIT => {
                self.unwrap_envelope(&element)?;
                self.next_message()
            }
            other => Err(FramingError::UnknownMessage(other)),
        }
    }

    /// Split an envelope's body into its messages. One level only.
    fn unwrap_envelope(&mut self, element: &[u8]) -> Result<(), FramingError> {
        let (_, body_len, header) = tlv::read_header(element)?;
        let body = &element[header..header + body_len];
        let mut offset = 0;
        while offset < body.len() {
            let span = match tlv::element_span(&body[offset..])? {
                Some(span) if offset + span <= body.len() => span,
                // A message truncated inside its envelope cannot be
                // completed by later bytes.
                _ => return Err(FramingError::Element(TlvError::Truncated)),
            };
            match body[offset] {
                types::INTEREST | types::CONTENT_OBJECT => self.pending.push(FramedMessage {
                    bytes: body[offset..offset + span].to_vec(),
                    from_envelope: true,
                }),
                types::PROTOCOL_DATA_UNIT => return Err(FramingError::NestedEnvelope),
                other => return Err(FramingError::UnknownMessage(other)),
            }
            offset += span;
        }
        Ok(())
    }
}

/// Wrap one encoded message in a link envelope.
pub fn wrap_in_envelope(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 6);
    tlv::write_header(&mut out, types::PROTOCOL_DATA_UNIT, msg.len());
    out.extend_from_slice(msg);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_core::packets::Interest;
    use ccn_core::Name;

    fn interest_bytes(uri: &str) -> Vec<u8> {
        Interest::new(Name::from_uri(uri)).encode()
    }

    #[test]
    fn extracts_back_to_back_messages() {
        let mut framer = MessageFramer::new();
        let a = interest_bytes("/a");
        let b = interest_bytes("/b");
        framer.push(&a);
        framer.push(&b);
        assert_eq!(framer.next_message().unwrap().unwrap().bytes, a);
        assert_eq!(framer.next_message().unwrap().unwrap().bytes, b);
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn waits_for_partial_message() {
        let mut framer = MessageFramer::new();
        let a = interest_bytes("/alpha/beta");
        framer.push(&a[..3]);
        assert!(framer.next_message().unwrap().is_none());
        framer.push(&a[3..]);
        assert_eq!(framer.next_message().unwrap().unwrap().bytes, a);
    }

    #[test]
    fn unwraps_envelope_and_marks_origin() {
        let mut framer = MessageFramer::new();
        let a = interest_bytes("/a");
        framer.push(&wrap_in_envelope(&a));
        let got = framer.next_message().unwrap().unwrap();
        assert_eq!(got.bytes, a);
        assert!(got.from_envelope);
    }

    #[test]
    fn refuses_nested_envelope() {
        let mut framer = MessageFramer::new();
        let inner = wrap_in_envelope(&interest_bytes("/a"));
        framer.push(&wrap_in_envelope(&inner));
        assert!(matches!(
            framer.next_message(),
            Err(FramingError::NestedEnvelope)
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut framer = MessageFramer::new();
        framer.push(&[0x33, 1, 0]);
        assert!(matches!(
            framer.next_message(),
            Err(FramingError::UnknownMessage(0x33))
        ));
    }

    #[test]
    fn clear_discards_state() {
        let mut framer = MessageFramer::new();
        framer.push(&[0x33, 200]);
        framer.clear();
        assert_eq!(framer.buffered(), 0);
        assert!(framer.next_message().unwrap().is_none());
    }
}
