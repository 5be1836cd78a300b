//! Faces and the face table.
//!
//! A face id packs a slot index in its low bits and a generation
//! counter in its high bits. The generation is bumped every time the
//! free-slot scan wraps, so ids minted before a slot was reused no
//! longer resolve.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use ccn_transport::framing::MessageFramer;

/// Hard cap on concurrently live faces. Power of two: the low bits of
/// a face id mask out the slot.
pub const MAX_FACES: usize = 1 << 16;
const SLOT_MASK: u32 = (MAX_FACES - 1) as u32;
const INITIAL_SLOTS: usize = 10;

pub mod flags {
    /// Datagram endpoint (as opposed to a connected stream).
    pub const DGRAM: u32 = 1 << 0;
    /// Peer wraps its messages in the link envelope; it is reached
    /// over a link, not local to this host.
    pub const LINK: u32 = 1 << 1;
    /// Local stream client on the listener socket.
    pub const LOCAL: u32 = 1 << 2;
    /// Marked for teardown; kept only until the sweep collects it.
    pub const GONE: u32 = 1 << 3;
}

#[derive(Debug, thiserror::Error)]
pub enum FaceTableError {
    #[error("face table is full ({0} faces)")]
    Exhausted(usize),
}

/// One connection endpoint.
#[derive(Debug)]
pub struct Face {
    pub id: u32,
    pub flags: u32,
    /// Peer address, for datagram faces.
    pub addr: Option<SocketAddr>,
    /// Inbound bytes and decoder state.
    pub framer: MessageFramer,
    /// Encoded messages awaiting transmission.
    pub sendq: VecDeque<Vec<u8>>,
    /// Messages received since the last sweep pass looked.
    pub recvcount: u32,
    /// Consecutive sweep passes that saw no activity.
    pub quiet: u8,
    /// Accession of the last content matched for this face, used to
    /// resume enumeration.
    pub cached_accession: Option<u64>,
}

impl Face {
    fn new(id: u32, flags: u32, addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            flags,
            addr,
            framer: MessageFramer::new(),
            sendq: VecDeque::new(),
            recvcount: 0,
            quiet: 0,
            cached_accession: None,
        }
    }

    pub fn is_dgram(&self) -> bool {
        self.flags & flags::DGRAM != 0
    }

    pub fn is_link(&self) -> bool {
        self.flags & flags::LINK != 0
    }

    pub fn is_gone(&self) -> bool {
        self.flags & flags::GONE != 0
    }
}

/// Registry of faces, addressed by stable ids.
#[derive(Debug)]
pub struct FaceTable {
    slots: Vec<Option<Face>>,
    face_gen: u32,
    rover: usize,
    count: usize,
    limit: usize,
    dgram_by_addr: HashMap<SocketAddr, u32>,
}

impl Default for FaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceTable {
    pub fn new() -> Self {
        Self::with_limit(MAX_FACES)
    }

    /// A table refusing enrollment past `limit` live slots; the hard
    /// cap still binds.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            face_gen: 0,
            rover: 0,
            count: 0,
            limit: limit.clamp(1, MAX_FACES),
            dgram_by_addr: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Register a new face and mint its id.
    pub fn enroll(&mut self, face_flags: u32, addr: Option<SocketAddr>) -> Result<u32, FaceTableError> {
        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => self.grow()?,
        };
        let id = self.face_gen | slot as u32;
        self.slots[slot] = Some(Face::new(id, face_flags, addr));
        self.count += 1;
        if let Some(addr) = addr {
            self.dgram_by_addr.insert(addr, id);
        }
        Ok(id)
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        for i in self.rover..self.slots.len() {
            if self.slots[i].is_none() {
                self.rover = i + 1;
                return Some(i);
            }
        }
        // The scan wrapped: retire every id minted under the old
        // generation before slots are reused.
        self.face_gen = self.face_gen.wrapping_add(SLOT_MASK + 1);
        for i in 0..self.rover.min(self.slots.len()) {
            if self.slots[i].is_none() {
                self.rover = i + 1;
                return Some(i);
            }
        }
        None
    }

    fn grow(&mut self) -> Result<usize, FaceTableError> {
        let old = self.slots.len();
        if old >= self.limit {
            return Err(FaceTableError::Exhausted(old));
        }
        let new = if old == 0 {
            INITIAL_SLOTS.min(self.limit)
        } else {
            ((old + 1) * 3 / 2).min(self.limit)
        };
        self.slots.resize_with(new, || None);
        self.rover = old + 1;
        Ok(old)
    }

    pub fn lookup(&self, id: u32) -> Option<&Face> {
        let slot = (id & SLOT_MASK) as usize;
        self.slots.get(slot)?.as_ref().filter(|f| f.id == id)
    }

    pub fn lookup_mut(&mut self, id: u32) -> Option<&mut Face> {
        let slot = (id & SLOT_MASK) as usize;
        self.slots.get_mut(slot)?.as_mut().filter(|f| f.id == id)
    }

    /// Clear the slot. The datagram-address mapping is owned by that
    /// table and is removed separately.
    pub fn release(&mut self, id: u32) -> Option<Face> {
        let slot = (id & SLOT_MASK) as usize;
        let entry = self.slots.get_mut(slot)?;
        if entry.as_ref().map(|f| f.id) != Some(id) {
            return None;
        }
        self.count -= 1;
        entry.take()
    }

    pub fn datagram_face(&self, addr: &SocketAddr) -> Option<u32> {
        self.dgram_by_addr.get(addr).copied()
    }

    pub fn unregister_datagram(&mut self, addr: &SocketAddr) {
        self.dgram_by_addr.remove(addr);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Face> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Face> {
        self.slots.iter_mut().flatten()
    }
}
