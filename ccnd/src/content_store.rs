//! The content store: every stored ContentObject, reachable two ways.
//!
//! An accession-ordered dense window gives numeric lookup; a
//! probabilistic skiplist keyed by the encoded name gives prefix
//! queries in canonical name order. The store holds at most one object
//! per name: a second object arriving under the same name with
//! different bytes discards both.

use std::cmp::Ordering;
use std::collections::HashMap;

use ccn_core::name::compare_keys;
use ccn_core::packets::ParsedContent;
use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::sched::TaskToken;

pub const SKIPLIST_MAX_DEPTH: usize = 30;
const SKIP_NONE: u64 = u64::MAX;

pub mod content_flags {
    /// Arrived unsolicited; pace sends of it well down.
    pub const SLOW_SEND: u32 = 1 << 0;
}

/// A stored ContentObject.
#[derive(Debug)]
pub struct ContentEntry {
    pub accession: u64,
    /// Encoded name components; the index key.
    pub key: Vec<u8>,
    /// The full encoded message as it will be sent.
    pub message: Vec<u8>,
    /// Component boundaries within `key` (ncomps + 1 offsets).
    pub comps: Vec<usize>,
    pub sig_offset: usize,
    pub sig_len: usize,
    pub publisher: Option<Vec<u8>>,
    /// Face ids to send to: `[0, nface_done)` have been sent,
    /// the rest are pending.
    pub faces: Vec<u32>,
    pub nface_done: usize,
    /// Value of `nface_done` as of the last cleaning pass.
    pub nface_old: usize,
    /// Active send-scheduling task, when one is due.
    pub sender: Option<TaskToken>,
    pub flags: u32,
    skiplinks: Vec<u64>,
}

impl ContentEntry {
    pub fn ncomps(&self) -> usize {
        self.comps.len() - 1
    }

    pub fn depth(&self) -> usize {
        self.skiplinks.len()
    }

    pub fn has_pending_faces(&self) -> bool {
        self.nface_done < self.faces.len()
    }

    pub fn is_done_for(&self, face_id: u32) -> bool {
        self.faces[..self.nface_done].contains(&face_id)
    }

    pub fn is_pending_for(&self, face_id: u32) -> bool {
        self.faces[self.nface_done..].contains(&face_id)
    }

    /// Queue `face_id` for sending, unless it is already queued.
    pub fn add_pending_face(&mut self, face_id: u32) {
        if !self.is_pending_for(face_id) {
            self.faces.push(face_id);
        }
    }

    /// Record that a face already holds this content, moving it into
    /// the done partition without a send.
    pub fn mark_done(&mut self, face_id: u32) {
        if self.is_done_for(face_id) {
            return;
        }
        let pos = match self.faces[self.nface_done..]
            .iter()
            .position(|&f| f == face_id)
        {
            Some(p) => self.nface_done + p,
            None => {
                self.faces.push(face_id);
                self.faces.len() - 1
            }
        };
        self.faces.swap(pos, self.nface_done);
        self.nface_done += 1;
    }

    /// Clear the already-sent mark so the content can be sent again.
    pub fn clear_done_mark(&mut self, face_id: u32) {
        if let Some(pos) = self.faces[..self.nface_done]
            .iter()
            .position(|&f| f == face_id)
        {
            self.nface_done -= 1;
            self.faces.swap(pos, self.nface_done);
            self.nface_old = self.nface_old.min(self.nface_done);
        }
    }

    pub fn signature_digest(&self) -> Option<[u8; 32]> {
        if self.sig_len != 32 {
            return None;
        }
        self.message
            .get(self.sig_offset..self.sig_offset + 32)?
            .try_into()
            .ok()
    }
}

/// Predecessor position at one skiplist level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pred {
    Head,
    Entry(u64),
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored under a fresh accession.
    New(u64),
    /// Byte-identical to an existing entry.
    Duplicate(u64),
    /// Same name, different bytes; both were discarded.
    Collision,
}

pub struct ContentStore {
    window: Vec<Option<ContentEntry>>,
    accession_base: u64,
    next_accession: u64,
    by_name: HashMap<Vec<u8>, u64>,
    head: Vec<u64>,
    rng: SmallRng,
}

impl ContentStore {
    pub fn new(seed: u64) -> Self {
        Self {
            window: Vec::new(),
            accession_base: 1,
            next_accession: 1,
            by_name: HashMap::new(),
            head: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn entry(&self, accession: u64) -> Option<&ContentEntry> {
        if accession < self.accession_base {
            return None;
        }
        let idx = (accession - self.accession_base) as usize;
        self.window
            .get(idx)?
            .as_ref()
            .filter(|e| e.accession == accession)
    }

    pub fn entry_mut(&mut self, accession: u64) -> Option<&mut ContentEntry> {
        if accession < self.accession_base {
            return None;
        }
        let idx = (accession - self.accession_base) as usize;
        self.window
            .get_mut(idx)?
            .as_mut()
            .filter(|e| e.accession == accession)
    }

    /// Store a parsed message. Duplicate and collision handling per the
    /// one-object-per-name rule.
    pub fn insert(&mut self, message: Vec<u8>, parsed: ParsedContent) -> InsertOutcome {
        if let Some(&existing) = self.by_name.get(&parsed.key) {
            let same = self
                .entry(existing)
                .map(|e| e.message == message)
                .unwrap_or(false);
            if same {
                return InsertOutcome::Duplicate(existing);
            }
            warn!("name collision, discarding both objects");
            self.remove(existing);
            return InsertOutcome::Collision;
        }

        let accession = self.next_accession;
        self.next_accession += 1;
        self.ensure_window(accession);

        let depth = self.random_depth();
        let mut entry = ContentEntry {
            accession,
            key: parsed.key,
            message,
            comps: parsed.comps,
            sig_offset: parsed.sig_offset,
            sig_len: parsed.sig_len,
            publisher: parsed.publisher,
            faces: Vec::new(),
            nface_done: 0,
            nface_old: 0,
            sender: None,
            flags: 0,
            skiplinks: vec![SKIP_NONE; depth],
        };

        if depth > self.head.len() {
            self.head.push(SKIP_NONE);
        }
        let preds = self.find_before(&entry.key);
        for lvl in 0..depth {
            entry.skiplinks[lvl] = self.link(preds[lvl], lvl);
        }
        self.by_name.insert(entry.key.clone(), accession);
        let idx = (accession - self.accession_base) as usize;
        self.window[idx] = Some(entry);
        for lvl in 0..depth {
            *self.link_mut(preds[lvl], lvl) = accession;
        }
        InsertOutcome::New(accession)
    }

    /// Unlink and drop an entry (collision handling).
    pub fn remove(&mut self, accession: u64) {
        let key = match self.entry(accession) {
            Some(e) => e.key.clone(),
            None => return,
        };
        let preds = self.find_before(&key);
        let depth = self.entry(accession).map(|e| e.depth()).unwrap_or(0);
        for lvl in 0..depth {
            if self.link(preds[lvl], lvl) == accession {
                let succ = self.entry(accession).unwrap().skiplinks[lvl];
                *self.link_mut(preds[lvl], lvl) = succ;
            }
        }
        self.by_name.remove(&key);
        let idx = (accession - self.accession_base) as usize;
        self.window[idx] = None;
    }

    /// Smallest-named entry whose key is `>=` the given key.
    pub fn first_at_or_after(&self, key: &[u8]) -> Option<u64> {
        let preds = self.find_before(key);
        let first = if self.head.is_empty() {
            SKIP_NONE
        } else {
            self.link(preds[0], 0)
        };
        (first != SKIP_NONE).then_some(first)
    }

    /// Name-order successor.
    pub fn next(&self, accession: u64) -> Option<u64> {
        let succ = self.entry(accession)?.skiplinks[0];
        (succ != SKIP_NONE).then_some(succ)
    }

    /// Accessions of every live entry, window order.
    pub fn accessions(&self) -> Vec<u64> {
        self.window
            .iter()
            .flatten()
            .map(|e| e.accession)
            .collect()
    }

    fn ensure_window(&mut self, accession: u64) {
        let mut idx = (accession - self.accession_base) as usize;
        if idx < self.window.len() {
            return;
        }
        // Trim dead low-end slots by advancing the base before growing.
        let lead = self.window.iter().take_while(|s| s.is_none()).count();
        if lead > 0 {
            self.window.drain(..lead);
            self.accession_base += lead as u64;
            idx = (accession - self.accession_base) as usize;
        }
        if idx >= self.window.len() {
            let want = (self.window.len() + self.window.len() / 2 + 20).max(idx + 1);
            self.window.resize_with(want, || None);
        }
    }

    /// Depth for a fresh entry: continue climbing with probability 1/4
    /// per level, bounded by the cap and by one above the current top
    /// level so the list grows a level at a time.
    fn random_depth(&mut self) -> usize {
        let mut d = 1;
        while d < SKIPLIST_MAX_DEPTH && self.rng.gen::<u32>() & 3 == 0 {
            d += 1;
        }
        d.min(self.head.len() + 1)
    }

    /// Per-level predecessors whose keys compare strictly less than
    /// `key`.
    fn find_before(&self, key: &[u8]) -> Vec<Pred> {
        let mut preds = vec![Pred::Head; self.head.len()];
        let mut pred = Pred::Head;
        for lvl in (0..self.head.len()).rev() {
            loop {
                let next = self.link(pred, lvl);
                if next == SKIP_NONE {
                    break;
                }
                let entry = self.entry(next).expect("skiplink to live entry");
                if compare_keys(&entry.key, key) == Ordering::Less {
                    pred = Pred::Entry(next);
                } else {
                    break;
                }
            }
            preds[lvl] = pred;
        }
        preds
    }

    fn link(&self, pred: Pred, lvl: usize) -> u64 {
        match pred {
            Pred::Head => self.head[lvl],
            Pred::Entry(acc) => self.entry(acc).expect("live predecessor").skiplinks[lvl],
        }
    }

    fn link_mut(&mut self, pred: Pred, lvl: usize) -> &mut u64 {
        match pred {
            Pred::Head => &mut self.head[lvl],
            Pred::Entry(acc) => {
                &mut self
                    .entry_mut(acc)
                    .expect("live predecessor")
                    .skiplinks[lvl]
            }
        }
    }

    #[cfg(test)]
    fn level_walk(&self, lvl: usize) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = self.head[lvl];
        while cur != SKIP_NONE {
            out.push(cur);
            cur = self.entry(cur).unwrap().skiplinks[lvl];
        }
        out
    }
}
