//! Interest demand and propagation state.
//!
//! Two tables share this module because their entries interlink: each
//! name-prefix entry owns a doubly-linked list of the propagating
//! interests that matched it. Propagating entries live in a slab
//! arena and link by `(prev, next)` slot index; the nonce map gives
//! O(1) duplicate detection.

use std::collections::HashMap;

use crate::limits::{DEMAND_CAP, MAX_IDLE_PASSES, REAP_SWEEPS, UNIT_DEMAND};
use crate::sched::TaskToken;

/// Per-prefix record of demanding faces.
#[derive(Debug, Default)]
pub struct PrefixEntry {
    pub ncomps: usize,
    /// Parallel vectors: one demanding face, one decaying counter.
    pub faces: Vec<u32>,
    pub counters: Vec<i32>,
    /// Consecutive aging passes that saw no demand.
    pub idle: u32,
    /// Head of this prefix's propagating-interest list.
    head: Option<usize>,
}

/// A forwarded interest awaiting its reply, keyed by nonce.
#[derive(Debug)]
pub struct PropagatingEntry {
    pub nonce: Vec<u8>,
    /// The encoded interest as it propagates (nonce included).
    pub message: Vec<u8>,
    pub ingress: u32,
    /// Faces still to be sent to, drained one per tick.
    pub outbound: Vec<u32>,
    pub prefix_key: Vec<u8>,
    /// Answered by arriving content; stop propagating.
    pub consumed: bool,
    /// Reaper sweeps seen since the outbound set drained.
    pub sweeps: u8,
    /// The pending propagation tick, if one is scheduled.
    pub ticker: Option<TaskToken>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct InterestTables {
    prefixes: HashMap<Vec<u8>, PrefixEntry>,
    arena: Vec<Option<PropagatingEntry>>,
    free: Vec<usize>,
    by_nonce: HashMap<Vec<u8>, usize>,
}

impl InterestTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(&self, key: &[u8]) -> Option<&PrefixEntry> {
        self.prefixes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Record one unit of demand from `face_id` at `key`, creating the
    /// prefix entry as needed.
    pub fn record_demand(&mut self, key: &[u8], ncomps: usize, face_id: u32) {
        let entry = self
            .prefixes
            .entry(key.to_vec())
            .or_insert_with(|| PrefixEntry {
                ncomps,
                ..Default::default()
            });
        entry.idle = 0;
        match entry.faces.iter().position(|&f| f == face_id) {
            Some(i) => entry.counters[i] = (entry.counters[i] + UNIT_DEMAND).min(DEMAND_CAP),
            None => {
                entry.faces.push(face_id);
                entry.counters.push(UNIT_DEMAND);
            }
        }
    }

    /// Take one unit back out of a face's demand counter when content
    /// answers it.
    pub fn consume_demand(&mut self, key: &[u8], face_id: u32) {
        if let Some(entry) = self.prefixes.get_mut(key) {
            if let Some(i) = entry.faces.iter().position(|&f| f == face_id) {
                entry.counters[i] = (entry.counters[i] - UNIT_DEMAND).max(0);
            }
        }
    }

    pub fn seen_nonce(&self, nonce: &[u8]) -> bool {
        self.by_nonce.contains_key(nonce)
    }

    pub fn propagating_count(&self) -> usize {
        self.by_nonce.len()
    }

    /// Enter a forwarded interest, linked at the front of its prefix's
    /// list. The prefix entry must already exist.
    pub fn insert_propagating(
        &mut self,
        nonce: Vec<u8>,
        message: Vec<u8>,
        ingress: u32,
        outbound: Vec<u32>,
        prefix_key: &[u8],
    ) -> usize {
        debug_assert!(self.prefixes.contains_key(prefix_key));
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.arena.push(None);
                self.arena.len() - 1
            }
        };
        let prefix = self
            .prefixes
            .get_mut(prefix_key)
            .expect("prefix entry exists before propagation");
        let next = prefix.head;
        prefix.head = Some(slot);
        if let Some(n) = next {
            self.arena[n].as_mut().unwrap().prev = Some(slot);
        }
        self.by_nonce.insert(nonce.clone(), slot);
        self.arena[slot] = Some(PropagatingEntry {
            nonce,
            message,
            ingress,
            outbound,
            prefix_key: prefix_key.to_vec(),
            consumed: false,
            sweeps: 0,
            ticker: None,
            prev: None,
            next,
        });
        slot
    }

    pub fn propagating(&self, slot: usize) -> Option<&PropagatingEntry> {
        self.arena.get(slot)?.as_ref()
    }

    pub fn propagating_mut(&mut self, slot: usize) -> Option<&mut PropagatingEntry> {
        self.arena.get_mut(slot)?.as_mut()
    }

    /// Slots of the propagating entries linked under `key`.
    pub fn propagating_for_prefix(&self, key: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.prefixes.get(key).and_then(|p| p.head);
        while let Some(slot) = cur {
            out.push(slot);
            cur = self.arena[slot].as_ref().unwrap().next;
        }
        out
    }

    /// Unlink and free a propagating entry.
    pub fn retire(&mut self, slot: usize) {
        let entry = match self.arena.get_mut(slot).and_then(Option::take) {
            Some(entry) => entry,
            None => return,
        };
        match entry.prev {
            Some(p) => self.arena[p].as_mut().unwrap().next = entry.next,
            None => {
                if let Some(prefix) = self.prefixes.get_mut(&entry.prefix_key) {
                    prefix.head = entry.next;
                }
            }
        }
        if let Some(n) = entry.next {
            self.arena[n].as_mut().unwrap().prev = entry.prev;
        }
        self.by_nonce.remove(&entry.nonce);
        self.free.push(slot);
    }

    /// One demand-aging pass. Returns true while any prefix remains.
    pub fn age_pass(&mut self) -> bool {
        let mut doomed = Vec::new();
        for (key, entry) in self.prefixes.iter_mut() {
            let mut i = 0;
            while i < entry.counters.len() {
                let c = entry.counters[i];
                // A factor of about the fourth root of one half.
                entry.counters[i] = if c > UNIT_DEMAND { (c * 5 + 3) / 6 } else { c - 1 };
                if entry.counters[i] <= 0 {
                    entry.faces.swap_remove(i);
                    entry.counters.swap_remove(i);
                } else {
                    i += 1;
                }
            }
            if entry.counters.is_empty() {
                entry.idle += 1;
                if entry.idle > MAX_IDLE_PASSES && entry.head.is_none() {
                    doomed.push(key.clone());
                }
            }
        }
        for key in doomed {
            self.prefixes.remove(&key);
        }
        !self.prefixes.is_empty()
    }

    /// One reaper pass over propagating entries: consumed entries go at
    /// once, drained ones after surviving two sweeps untouched.
    pub fn reap_pass(&mut self) {
        let slots: Vec<usize> = (0..self.arena.len())
            .filter(|&s| self.arena[s].is_some())
            .collect();
        for slot in slots {
            let entry = self.arena[slot].as_mut().unwrap();
            if entry.consumed {
                self.retire(slot);
            } else if entry.outbound.is_empty() {
                entry.sweeps += 1;
                if entry.sweeps >= REAP_SWEEPS {
                    self.retire(slot);
                }
            }
        }
    }

    #[cfg(test)]
    fn check_links(&self) {
        for (key, prefix) in &self.prefixes {
            let mut prev = None;
            let mut cur = prefix.head;
            while let Some(slot) = cur {
                let entry = self.arena[slot].as_ref().unwrap();
                assert_eq!(entry.prev, prev, "back-link mismatch under {key:?}");
                assert_eq!(&entry.prefix_key, key);
                prev = Some(slot);
                cur = entry.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn demand_accumulates_and_saturates() {
        let mut tables = InterestTables::new();
        for _ in 0..100 {
            tables.record_demand(&key("/x"), 1, 7);
        }
        let entry = tables.prefix(&key("/x")).unwrap();
        assert_eq!(entry.faces.len(), 1);
        assert_eq!(entry.counters[0], DEMAND_CAP);
    }

    #[test]
    fn parallel_vectors_stay_parallel() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        tables.record_demand(&key("/x"), 1, 2);
        tables.record_demand(&key("/x"), 1, 3);
        for _ in 0..40 {
            tables.age_pass();
            if let Some(e) = tables.prefix(&key("/x")) {
                assert_eq!(e.faces.len(), e.counters.len());
                assert!(e.counters.iter().all(|&c| c > 0));
            }
        }
    }

    #[test]
    fn consume_demand_takes_back_one_unit() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 7);
        tables.record_demand(&key("/x"), 1, 7);
        tables.consume_demand(&key("/x"), 7);
        assert_eq!(tables.prefix(&key("/x")).unwrap().counters, vec![UNIT_DEMAND]);
        tables.consume_demand(&key("/x"), 7);
        assert_eq!(tables.prefix(&key("/x")).unwrap().counters, vec![0]);
        // Unknown faces and prefixes are ignored.
        tables.consume_demand(&key("/x"), 9);
        tables.consume_demand(&key("/y"), 7);
    }

    #[test]
    fn aging_halves_over_four_passes() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 7);
        let start = tables.prefix(&key("/x")).unwrap().counters[0];
        // Push the counter above the unit so the multiplicative decay
        // applies.
        for _ in 0..3 {
            tables.record_demand(&key("/x"), 1, 7);
        }
        let high = tables.prefix(&key("/x")).unwrap().counters[0];
        assert!(high > start);
        for _ in 0..4 {
            tables.age_pass();
        }
        let aged = tables.prefix(&key("/x")).unwrap().counters[0];
        assert!(aged <= high / 2 + 1, "{high} aged to {aged}");
    }

    #[test]
    fn idle_prefix_dies_after_ninth_empty_pass() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 7);
        let mut passes = 0;
        while tables.prefix(&key("/x")).is_some() {
            tables.age_pass();
            passes += 1;
            assert!(passes < 40, "prefix never expired");
        }
        // Counter drains first, then eight idle passes are tolerated
        // and the ninth deletes.
        let drain = UNIT_DEMAND as u32;
        assert_eq!(passes, drain + MAX_IDLE_PASSES + 1);
        assert!(tables.is_empty());
    }

    #[test]
    fn propagating_list_links_back() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        let a = tables.insert_propagating(vec![1], vec![], 1, vec![], &key("/x"));
        let b = tables.insert_propagating(vec![2], vec![], 2, vec![], &key("/x"));
        let c = tables.insert_propagating(vec![3], vec![], 3, vec![], &key("/x"));
        tables.check_links();
        assert_eq!(tables.propagating_for_prefix(&key("/x")), vec![c, b, a]);
        tables.retire(b);
        tables.check_links();
        assert_eq!(tables.propagating_for_prefix(&key("/x")), vec![c, a]);
        tables.retire(c);
        tables.check_links();
        assert_eq!(tables.propagating_for_prefix(&key("/x")), vec![a]);
    }

    #[test]
    fn nonce_lookup_tracks_lifecycle() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        let slot = tables.insert_propagating(vec![9, 9], vec![], 1, vec![2, 3], &key("/x"));
        assert!(tables.seen_nonce(&[9, 9]));
        tables.retire(slot);
        assert!(!tables.seen_nonce(&[9, 9]));
    }

    #[test]
    fn reaper_takes_two_sweeps_for_drained_entries() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        tables.insert_propagating(vec![1], vec![], 1, vec![], &key("/x"));
        tables.reap_pass();
        assert_eq!(tables.propagating_count(), 1);
        tables.reap_pass();
        assert_eq!(tables.propagating_count(), 0);
    }

    #[test]
    fn reaper_takes_consumed_entries_at_once() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        let slot = tables.insert_propagating(vec![1], vec![], 1, vec![5], &key("/x"));
        tables.propagating_mut(slot).unwrap().consumed = true;
        tables.reap_pass();
        assert_eq!(tables.propagating_count(), 0);
    }

    #[test]
    fn prefix_with_live_propagation_survives_idle() {
        let mut tables = InterestTables::new();
        tables.record_demand(&key("/x"), 1, 1);
        tables.insert_propagating(vec![1], vec![], 1, vec![2], &key("/x"));
        for _ in 0..30 {
            tables.age_pass();
        }
        assert!(tables.prefix(&key("/x")).is_some());
    }
}
