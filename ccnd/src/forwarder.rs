//! The forwarder: message dispatch, matching, propagation, and the
//! housekeeping tasks.
//!
//! All state lives here and is touched only from the event loop task.
//! The I/O layer feeds received bytes in through [`Forwarder::handle_input`],
//! drains per-face send queues, and drives [`Forwarder::run_due`] from
//! the scheduler's next deadline.

use std::net::SocketAddr;

use ccn_core::name::{component_offsets, component_offsets_into};
use ccn_core::packets::{
    parse_content, types, ContentObject, Interest, NONCE_LEN, ORDER_PREF_RIGHTMOST,
};
use ccn_transport::framing::{wrap_in_envelope, FramingError};
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::content_store::{content_flags, ContentEntry, ContentStore, InsertOutcome};
use crate::face::{flags, FaceTable, FaceTableError, MAX_FACES};
use crate::interest_table::InterestTables;
use crate::limits::{
    AGING_PERIOD_MICROS, CLEAN_PERIOD_MICROS, DATA_PAUSE_MICROS,
    PROPAGATE_DELAY_BASE_MICROS, PROPAGATE_DELAY_SPREAD_MICROS, REAP_PERIOD_MICROS, REAP_SWEEPS,
};
use crate::scratch::ScratchPool;
use crate::sched::{Scheduler, TaskKind, TaskToken};
use crate::stats::ForwarderStats;

/// Knobs the daemon configuration exposes.
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// Suppress re-sending content a face already has, even without a
    /// response filter.
    pub short_term_blocking: bool,
    /// Soft cap on live faces, at most the table's hard cap.
    pub max_faces: usize,
    /// Quiet reaper sweeps before a datagram face is dropped.
    pub datagram_idle_sweeps: u8,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            short_term_blocking: false,
            max_faces: MAX_FACES,
            datagram_idle_sweeps: REAP_SWEEPS,
        }
    }
}

/// A prepared interest-matching query: the encoded prefix key, its
/// component boundaries, and the stripped digest when the final
/// component names one explicitly.
struct Probe<'a> {
    key: &'a [u8],
    offsets: &'a [usize],
    p: usize,
    digest: Option<[u8; 32]>,
}

impl<'a> Probe<'a> {
    fn new(interest: &Interest, key: &'a [u8], offsets: &'a [usize]) -> Self {
        let p = interest.name.len();
        let digest = interest
            .name
            .get(p.wrapping_sub(1))
            .filter(|c| c.is_digest())
            .and_then(|c| c.value.as_slice().try_into().ok());
        Self {
            key,
            offsets,
            p,
            digest,
        }
    }

    /// Components that bound the skiplist walk; the digest component
    /// is not part of the stored name.
    fn range_comps(&self) -> usize {
        if self.digest.is_some() {
            self.p - 1
        } else {
            self.p
        }
    }

    fn search_key(&self) -> &[u8] {
        &self.key[..self.offsets[self.range_comps()]]
    }

    fn in_range(&self, entry_key: &[u8]) -> bool {
        let span = self.offsets[self.range_comps()];
        entry_key.len() >= span && entry_key[..span] == self.key[..span]
    }

    /// The strict prefix-match rule: the prefix must leave room for at
    /// least one named child, unless a digest component pins an exact
    /// object.
    fn prefix_match(&self, entry: &ContentEntry) -> bool {
        if !self.in_range(&entry.key) {
            return false;
        }
        match self.digest {
            None => entry.ncomps() >= self.p + 1,
            Some(d) => {
                entry.ncomps() + 1 == self.p
                    && ContentObject::implicit_digest(&entry.message) == d
            }
        }
    }
}

pub struct Forwarder {
    pub faces: FaceTable,
    pub store: ContentStore,
    pub interests: InterestTables,
    pub sched: Scheduler,
    pub stats: ForwarderStats,
    scratch: ScratchPool,
    rng: SmallRng,
    short_term_blocking: bool,
    datagram_idle_sweeps: u8,
    age_task: Option<TaskToken>,
    reap_task: Option<TaskToken>,
    clean_task: Option<TaskToken>,
}

impl Forwarder {
    pub fn new(seed: u64, options: ForwarderOptions) -> Self {
        Self {
            faces: FaceTable::with_limit(options.max_faces),
            store: ContentStore::new(seed),
            interests: InterestTables::new(),
            sched: Scheduler::new(),
            stats: ForwarderStats::default(),
            scratch: ScratchPool::new(),
            rng: SmallRng::seed_from_u64(seed ^ 0x6363_6e64),
            short_term_blocking: options.short_term_blocking,
            datagram_idle_sweeps: options.datagram_idle_sweeps.max(1),
            age_task: None,
            reap_task: None,
            clean_task: None,
        }
    }

    /// Arm the periodic housekeeping.
    pub fn start(&mut self, now: u64) {
        self.clean_task = Some(self.sched.schedule(now, CLEAN_PERIOD_MICROS, TaskKind::Clean));
    }

    // ---- face lifecycle ----

    pub fn create_face(
        &mut self,
        face_flags: u32,
        addr: Option<SocketAddr>,
        now: u64,
    ) -> Result<u32, FaceTableError> {
        let id = self.faces.enroll(face_flags, addr)?;
        self.stats.faces_created += 1;
        info!("face {id:#x} created (flags {face_flags:#x})");
        if face_flags & flags::DGRAM != 0 {
            self.ensure_reaper(now);
        }
        Ok(id)
    }

    /// Face for a datagram peer, created on its first datagram.
    pub fn datagram_face(&mut self, addr: SocketAddr, now: u64) -> Result<u32, FaceTableError> {
        if let Some(id) = self.faces.datagram_face(&addr) {
            if self.faces.lookup(id).is_some() {
                return Ok(id);
            }
            self.faces.unregister_datagram(&addr);
        }
        self.create_face(flags::DGRAM, Some(addr), now)
    }

    pub fn destroy_face(&mut self, face_id: u32) {
        if let Some(face) = self.faces.release(face_id) {
            if let Some(addr) = face.addr {
                self.faces.unregister_datagram(&addr);
            }
            self.stats.faces_destroyed += 1;
            info!("face {face_id:#x} destroyed");
        }
    }

    // ---- input path ----

    /// Feed received bytes. A framing error from a stream face is
    /// returned so the caller can tear the face down; on a datagram
    /// face the buffer is discarded and processing continues.
    pub fn handle_input(
        &mut self,
        face_id: u32,
        bytes: &[u8],
        now: u64,
    ) -> Result<(), FramingError> {
        let mut msgs = Vec::new();
        let mut saw_envelope = false;
        let mut framing_err = None;
        let is_dgram;
        {
            let Some(face) = self.faces.lookup_mut(face_id) else {
                return Ok(());
            };
            is_dgram = face.is_dgram();
            face.recvcount = face.recvcount.saturating_add(1);
            if is_dgram {
                face.quiet = 0;
                face.flags &= !flags::GONE;
                // A datagram of at most one byte is a heartbeat: it
                // refreshes the face but carries no message.
                if bytes.len() <= 1 {
                    debug!("face {face_id:#x}: {}-byte heartbeat", bytes.len());
                    return Ok(());
                }
            }
            face.framer.push(bytes);
            loop {
                match face.framer.next_message() {
                    Ok(Some(m)) => {
                        saw_envelope |= m.from_envelope;
                        msgs.push(m.bytes);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        framing_err = Some(e);
                        break;
                    }
                }
            }
            if saw_envelope {
                face.flags |= flags::LINK;
            }
            if framing_err.is_some() && is_dgram {
                face.framer.clear();
            }
        }
        for msg in msgs {
            self.dispatch(face_id, msg, now);
        }
        if let Some(e) = framing_err {
            self.stats.parse_errors += 1;
            if is_dgram {
                debug!("face {face_id:#x}: datagram framing error: {e}");
                return Ok(());
            }
            warn!("face {face_id:#x}: protocol error: {e}");
            return Err(e);
        }
        Ok(())
    }

    fn dispatch(&mut self, face_id: u32, msg: Vec<u8>, now: u64) {
        match msg.first() {
            Some(&types::INTEREST) => self.process_interest(face_id, msg, now),
            Some(&types::CONTENT_OBJECT) => self.process_content(face_id, msg, now),
            _ => self.stats.parse_errors += 1,
        }
    }

    // ---- interest handling ----

    fn process_interest(&mut self, face_id: u32, msg: Vec<u8>, now: u64) {
        self.stats.interests_received += 1;
        let interest = match Interest::decode(&msg) {
            Ok((interest, _)) => interest,
            Err(e) => {
                warn!("face {face_id:#x}: malformed interest: {e}");
                self.stats.parse_errors += 1;
                return;
            }
        };
        let from_link = self
            .faces
            .lookup(face_id)
            .map(|f| f.is_link())
            .unwrap_or(false);
        if from_link && matches!(interest.scope, Some(0) | Some(1)) {
            warn!(
                "face {face_id:#x}: scope {} interest over a link, dropped",
                interest.scope.unwrap()
            );
            self.stats.interests_dropped += 1;
            return;
        }
        if let Some(nonce) = &interest.nonce {
            if self.interests.seen_nonce(nonce) {
                self.stats.duplicate_nonces += 1;
                self.stats.interests_dropped += 1;
                return;
            }
        }

        let mut key = self.scratch.charge_buf();
        interest.name.encode_components_into(&mut key);
        let mut offsets = self.scratch.charge_indexes();
        let hit = match component_offsets_into(&key, &mut offsets) {
            Ok(()) => {
                let probe = Probe::new(&interest, &key, &offsets);
                self.find_match(face_id, &interest, &probe)
            }
            Err(_) => None,
        };
        match hit {
            Some(accession) => self.deliver_content(accession, face_id, now),
            None => self.propagate_interest(face_id, msg, &interest, &key, now),
        }
        self.scratch.return_indexes(offsets);
        self.scratch.return_buf(key);
    }

    /// Walk the ordered store for the entry answering `interest`, or
    /// None. Rightmost order preference keeps walking and takes the
    /// last hit.
    fn find_match(&mut self, face_id: u32, interest: &Interest, probe: &Probe) -> Option<u64> {
        let rightmost = interest.order_preference == Some(ORDER_PREF_RIGHTMOST);

        // An enumeration in progress resumes just past the face's last
        // match rather than from the front of the prefix.
        let hint = self
            .faces
            .lookup_mut(face_id)
            .and_then(|f| f.cached_accession.take());
        let mut cur = None;
        if let Some(hint) = hint {
            if probe.digest.is_none() && interest.order_preference.unwrap_or(0) <= 1 {
                if let Some(entry) = self.store.entry(hint) {
                    if entry.ncomps() == probe.p + 1 && probe.in_range(&entry.key) {
                        cur = self.store.next(hint);
                    }
                }
            }
        }
        let mut cur = cur
            .filter(|&acc| {
                self.store
                    .entry(acc)
                    .map(|e| probe.in_range(&e.key))
                    .unwrap_or(false)
            })
            .or_else(|| self.store.first_at_or_after(probe.search_key()));

        let mut best = None;
        while let Some(accession) = cur {
            let entry = self.store.entry(accession).expect("walk over live entries");
            if !probe.in_range(&entry.key) {
                break;
            }
            if self.entry_hits(entry, interest, probe, face_id) {
                best = Some(accession);
                if !rightmost {
                    break;
                }
            }
            cur = self.store.next(accession);
        }
        best
    }

    /// Full per-entry decision: strict prefix rule, response filter or
    /// short-term blocking, then the codec's selectors.
    fn entry_hits(
        &self,
        entry: &ContentEntry,
        interest: &Interest,
        probe: &Probe,
        face_id: u32,
    ) -> bool {
        if !probe.prefix_match(entry) {
            return false;
        }
        match &interest.response_filter {
            Some(filter) => {
                if let Some(digest) = entry.signature_digest() {
                    if filter.contains(&digest) {
                        return false;
                    }
                }
            }
            None => {
                // Blocking covers the whole face-send set: queued
                // counts the same as already sent.
                if self.short_term_blocking
                    && (entry.is_done_for(face_id) || entry.is_pending_for(face_id))
                {
                    return false;
                }
            }
        }
        interest.selectors_match_parts(&entry.key, &entry.comps, entry.publisher.as_deref())
    }

    fn deliver_content(&mut self, accession: u64, face_id: u32, now: u64) {
        self.stats.interests_satisfied += 1;
        if let Some(entry) = self.store.entry_mut(accession) {
            // Reaching here past a previously-sent mark means either
            // the response filter said "not seen" or blocking is off;
            // both ask for a resend.
            entry.clear_done_mark(face_id);
            entry.add_pending_face(face_id);
        }
        self.schedule_content_sender(accession, now);
        if let Some(face) = self.faces.lookup_mut(face_id) {
            face.cached_accession = Some(accession);
        }
    }

    fn propagate_interest(
        &mut self,
        face_id: u32,
        msg: Vec<u8>,
        interest: &Interest,
        key: &[u8],
        now: u64,
    ) {
        self.interests
            .record_demand(key, interest.name.len(), face_id);
        if self.age_task.is_none() {
            self.age_task = Some(
                self.sched
                    .schedule(now, AGING_PERIOD_MICROS, TaskKind::AgeDemand),
            );
        }

        // What propagates carries a nonce, synthesized here if the
        // arriving interest had none.
        let (nonce, out_msg) = match &interest.nonce {
            Some(n) => (n.clone(), msg),
            None => {
                let mut n = vec![0u8; NONCE_LEN];
                self.rng.fill(&mut n[..]);
                match Interest::splice_nonce(&msg, &n) {
                    Ok(spliced) => (n, spliced),
                    Err(e) => {
                        warn!("face {face_id:#x}: nonce splice failed: {e}");
                        self.stats.parse_errors += 1;
                        return;
                    }
                }
            }
        };

        let scope = interest.scope;
        let outbound: Vec<u32> = if scope == Some(0) {
            Vec::new()
        } else {
            self.faces
                .iter()
                .filter(|f| {
                    f.id != face_id && !f.is_gone() && !(scope == Some(1) && f.is_link())
                })
                .map(|f| f.id)
                .collect()
        };

        let slot = self
            .interests
            .insert_propagating(nonce, out_msg, face_id, outbound, key);
        let delay = self.rng.gen_range(0..PROPAGATE_DELAY_SPREAD_MICROS);
        let token = self
            .sched
            .schedule(now, delay, TaskKind::PropagateInterest { slot });
        self.interests.propagating_mut(slot).unwrap().ticker = Some(token);
        self.ensure_reaper(now);
    }

    // ---- content handling ----

    fn process_content(&mut self, face_id: u32, msg: Vec<u8>, now: u64) {
        self.stats.content_received += 1;
        let parsed = match parse_content(&msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("face {face_id:#x}: malformed content object: {e}");
                self.stats.parse_errors += 1;
                return;
            }
        };
        match self.store.insert(msg, parsed) {
            InsertOutcome::Collision => {
                self.stats.content_collisions += 1;
            }
            InsertOutcome::Duplicate(accession) => {
                self.stats.content_duplicates += 1;
                // The sender already holds this content; note it as
                // done so no copy goes back.
                if let Some(entry) = self.store.entry_mut(accession) {
                    entry.mark_done(face_id);
                }
                self.match_interests(accession, face_id, now);
                self.schedule_content_sender(accession, now);
            }
            InsertOutcome::New(accession) => {
                self.stats.content_stored += 1;
                if let Some(entry) = self.store.entry_mut(accession) {
                    entry.mark_done(face_id);
                }
                let consumed = self.match_interests(accession, face_id, now);
                if !consumed {
                    if let Some(entry) = self.store.entry_mut(accession) {
                        entry.flags |= content_flags::SLOW_SEND;
                    }
                }
                self.schedule_content_sender(accession, now);
            }
        }
    }

    /// Consume the pending interests a newly arrived content answers.
    /// Returns whether any interest was waiting for it.
    fn match_interests(&mut self, accession: u64, source_face: u32, now: u64) -> bool {
        let (key, comps) = match self.store.entry(accession) {
            Some(e) => (e.key.clone(), e.comps.clone()),
            None => return false,
        };
        let ncomps = comps.len() - 1;
        let mut recipients = Vec::new();
        let mut any = false;
        for p in 0..=ncomps {
            let prefix = &key[..comps[p]];
            if self.interests.prefix(prefix).is_none() {
                continue;
            }
            for slot in self.interests.propagating_for_prefix(prefix) {
                let (imsg, ingress, consumed) = {
                    let e = self.interests.propagating(slot).unwrap();
                    (e.message.clone(), e.ingress, e.consumed)
                };
                if consumed {
                    continue;
                }
                let Ok((interest, _)) = Interest::decode(&imsg) else {
                    continue;
                };
                if !self.stored_interest_hits(accession, &interest, ingress) {
                    continue;
                }
                {
                    let entry = self.interests.propagating_mut(slot).unwrap();
                    entry.consumed = true;
                    entry.outbound.clear();
                }
                self.interests.consume_demand(prefix, ingress);
                any = true;
                if ingress != source_face {
                    recipients.push(ingress);
                }
            }
        }
        for face_id in recipients {
            if self.faces.lookup(face_id).is_some() {
                if let Some(entry) = self.store.entry_mut(accession) {
                    entry.add_pending_face(face_id);
                }
            }
        }
        any
    }

    fn stored_interest_hits(&self, accession: u64, interest: &Interest, face_id: u32) -> bool {
        let key = interest.name.encode_components();
        let Ok(offsets) = component_offsets(&key) else {
            return false;
        };
        let probe = Probe::new(interest, &key, &offsets);
        match self.store.entry(accession) {
            Some(entry) => self.entry_hits(entry, interest, &probe, face_id),
            None => false,
        }
    }

    // ---- scheduled tasks ----

    pub fn next_deadline(&self) -> Option<u64> {
        self.sched.next_deadline()
    }

    /// Fire every task due at `now`.
    pub fn run_due(&mut self, now: u64) {
        while let Some((token, kind)) = self.sched.pop_due(now) {
            match kind {
                TaskKind::AgeDemand => self.fire_age(token, now),
                TaskKind::Reap => self.fire_reap(token, now),
                TaskKind::Clean => self.fire_clean(token, now),
                TaskKind::SendContent { accession } => {
                    self.fire_send_content(token, accession, now)
                }
                TaskKind::PropagateInterest { slot } => self.fire_propagate(token, slot, now),
            }
        }
    }

    fn schedule_content_sender(&mut self, accession: u64, now: u64) {
        let (target, slow) = match self.store.entry(accession) {
            Some(e) if e.sender.is_none() && e.has_pending_faces() => {
                (e.faces[e.nface_done], e.flags & content_flags::SLOW_SEND != 0)
            }
            _ => return,
        };
        let fflags = self
            .faces
            .lookup(target)
            .filter(|f| !f.is_gone())
            .map(|f| f.flags);
        let delay = match fflags {
            Some(fl) => self.choose_content_delay(fl, slow),
            None => 1,
        };
        let token = self
            .sched
            .schedule(now, delay, TaskKind::SendContent { accession });
        self.store.entry_mut(accession).unwrap().sender = Some(token);
    }

    /// Send to pending faces, advancing the done partition. Vanished
    /// faces just drain their slots; after a real send, the delay
    /// before the next firing is paced by the face about to receive
    /// that next copy.
    fn fire_send_content(&mut self, token: TaskToken, accession: u64, now: u64) {
        {
            let Some(entry) = self.store.entry_mut(accession) else {
                return;
            };
            if entry.sender != Some(token) {
                return;
            }
            entry.sender = None;
        }
        loop {
            let face_id = {
                let Some(entry) = self.store.entry_mut(accession) else {
                    return;
                };
                if !entry.has_pending_faces() {
                    return;
                }
                let face_id = entry.faces[entry.nface_done];
                entry.nface_done += 1;
                face_id
            };
            if self
                .faces
                .lookup(face_id)
                .map(|f| f.is_gone())
                .unwrap_or(true)
            {
                continue;
            }
            let (msg, slow) = {
                let entry = self.store.entry(accession).expect("entry checked above");
                (
                    entry.message.clone(),
                    entry.flags & content_flags::SLOW_SEND != 0,
                )
            };
            self.queue_frame(face_id, &msg);
            self.stats.content_sent += 1;
            let upcoming = self
                .store
                .entry(accession)
                .and_then(|e| e.faces.get(e.nface_done).copied());
            if let Some(next_target) = upcoming {
                let fflags = self
                    .faces
                    .lookup(next_target)
                    .filter(|f| !f.is_gone())
                    .map(|f| f.flags);
                let delay = match fflags {
                    Some(fl) => self.choose_content_delay(fl, slow),
                    // One microsecond to drain a vanished slot.
                    None => 1,
                };
                let next = self
                    .sched
                    .schedule(now, delay, TaskKind::SendContent { accession });
                self.store.entry_mut(accession).unwrap().sender = Some(next);
            }
            return;
        }
    }

    fn choose_content_delay(&mut self, fflags: u32, slow: bool) -> u64 {
        if fflags & flags::LINK != 0 {
            let base = self
                .rng
                .gen_range(DATA_PAUSE_MICROS / 2..DATA_PAUSE_MICROS * 3 / 2);
            if slow {
                base * 4
            } else {
                base
            }
        } else if fflags & flags::DGRAM != 0 {
            100
        } else {
            10
        }
    }

    /// One outbound face per tick until the set drains, then the entry
    /// waits for its reply.
    fn fire_propagate(&mut self, token: TaskToken, slot: usize, now: u64) {
        let next = {
            let Some(entry) = self.interests.propagating_mut(slot) else {
                return;
            };
            if entry.ticker != Some(token) {
                return;
            }
            entry.ticker = None;
            if entry.consumed {
                return;
            }
            entry.outbound.pop().map(|f| (f, entry.message.clone()))
        };
        if let Some((face_id, msg)) = next {
            if self.queue_frame(face_id, &msg) {
                self.stats.interests_propagated += 1;
            }
        }
        let more = self
            .interests
            .propagating(slot)
            .map(|e| !e.outbound.is_empty())
            .unwrap_or(false);
        if more {
            let delay = PROPAGATE_DELAY_BASE_MICROS
                + self.rng.gen_range(0..PROPAGATE_DELAY_SPREAD_MICROS);
            let next = self
                .sched
                .schedule(now, delay, TaskKind::PropagateInterest { slot });
            self.interests.propagating_mut(slot).unwrap().ticker = Some(next);
        }
    }

    fn fire_age(&mut self, token: TaskToken, now: u64) {
        if self.age_task != Some(token) {
            return;
        }
        self.age_task = None;
        if self.interests.age_pass() {
            self.age_task = Some(
                self.sched
                    .schedule(now, AGING_PERIOD_MICROS, TaskKind::AgeDemand),
            );
        }
    }

    fn fire_reap(&mut self, token: TaskToken, now: u64) {
        if self.reap_task != Some(token) {
            return;
        }
        self.reap_task = None;
        self.interests.reap_pass();
        // Datagram faces quiet for enough consecutive sweeps go away,
        // marked gone one sweep before so nothing more is queued.
        let sweeps = self.datagram_idle_sweeps;
        let mut doomed = Vec::new();
        for face in self.faces.iter_mut() {
            if !face.is_dgram() {
                continue;
            }
            if face.recvcount == 0 {
                face.quiet = face.quiet.saturating_add(1);
                if face.quiet >= sweeps {
                    doomed.push(face.id);
                } else if face.quiet + 1 == sweeps {
                    face.flags |= flags::GONE;
                }
            } else {
                face.recvcount = 0;
                face.quiet = 0;
                face.flags &= !flags::GONE;
            }
        }
        for id in doomed {
            self.destroy_face(id);
        }
        self.ensure_reaper(now);
    }

    fn ensure_reaper(&mut self, now: u64) {
        if self.reap_task.is_some() {
            return;
        }
        let needed = self.interests.propagating_count() > 0
            || self.faces.iter().any(|f| f.is_dgram());
        if needed {
            self.reap_task = Some(self.sched.schedule(now, REAP_PERIOD_MICROS, TaskKind::Reap));
        }
    }

    /// Compact every content entry's face-send set against the live
    /// face table, preserving the done count.
    fn fire_clean(&mut self, token: TaskToken, now: u64) {
        if self.clean_task != Some(token) {
            return;
        }
        let live: std::collections::HashSet<u32> = self
            .faces
            .iter()
            .filter(|f| !f.is_gone())
            .map(|f| f.id)
            .collect();
        for accession in self.store.accessions() {
            if let Some(entry) = self.store.entry_mut(accession) {
                let mut kept = Vec::with_capacity(entry.faces.len());
                let mut done = 0;
                for (i, &face_id) in entry.faces.iter().enumerate() {
                    if live.contains(&face_id) {
                        if i < entry.nface_done {
                            done += 1;
                        }
                        kept.push(face_id);
                    }
                }
                entry.faces = kept;
                entry.nface_done = done;
                entry.nface_old = done;
            }
        }
        self.stats.log_summary();
        self.clean_task = Some(self.sched.schedule(now, CLEAN_PERIOD_MICROS, TaskKind::Clean));
    }

    // ---- output ----

    /// Queue one message on a face, wrapping it for link-framed peers.
    fn queue_frame(&mut self, face_id: u32, msg: &[u8]) -> bool {
        let Some(face) = self.faces.lookup_mut(face_id) else {
            return false;
        };
        if face.is_gone() {
            return false;
        }
        let frame = if face.is_link() {
            wrap_in_envelope(msg)
        } else {
            msg.to_vec()
        };
        face.sendq.push_back(frame);
        true
    }

    /// Drain the queued output of one face.
    pub fn take_sendq(&mut self, face_id: u32) -> Vec<Vec<u8>> {
        match self.faces.lookup_mut(face_id) {
            Some(face) => face.sendq.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Faces that currently have queued output.
    pub fn faces_with_output(&self) -> Vec<u32> {
        self.faces
            .iter()
            .filter(|f| !f.sendq.is_empty())
            .map(|f| f.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::UNIT_DEMAND;
    use ccn_core::Name;
    use sha2::{Digest, Sha256};

    fn fwd() -> Forwarder {
        Forwarder::new(1, ForwarderOptions::default())
    }

    fn fwd_blocking() -> Forwarder {
        Forwarder::new(
            1,
            ForwarderOptions {
                short_term_blocking: true,
                ..Default::default()
            },
        )
    }

    fn stream_face(f: &mut Forwarder) -> u32 {
        f.create_face(flags::LOCAL, None, 0).unwrap()
    }

    fn interest_msg(uri: &str) -> Vec<u8> {
        Interest::new(Name::from_uri(uri)).encode()
    }

    fn content_msg(uri: &str, payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        ContentObject::new(
            Name::from_uri(uri),
            hasher.finalize().to_vec(),
            payload.to_vec(),
        )
        .encode()
    }

    fn run_until(f: &mut Forwarder, upto: u64) {
        while let Some(due) = f.next_deadline() {
            if due > upto {
                break;
            }
            f.run_due(due);
        }
    }

    fn key_of(uri: &str) -> Vec<u8> {
        Name::from_uri(uri).encode_components()
    }

    #[test]
    fn interest_with_no_prior_content_registers_demand() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();

        let entry = f.interests.prefix(&key_of("/x/y")).unwrap();
        assert_eq!(entry.faces, vec![a]);
        assert_eq!(entry.counters, vec![UNIT_DEMAND]);
        assert_eq!(f.interests.propagating_count(), 1);

        run_until(&mut f, 1_000_000);
        assert!(f.take_sendq(a).is_empty());
    }

    #[test]
    fn content_then_interest_yields_one_reply() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let content = content_msg("/x/y/1", b"payload");
        f.handle_input(b, &content, 0).unwrap();
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();

        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a), vec![content]);
        assert!(f.take_sendq(b).is_empty());
        assert_eq!(f.interests.propagating_count(), 0);

        let acc = f.store.accessions()[0];
        assert!(f.store.entry(acc).unwrap().is_done_for(a));
    }

    #[test]
    fn interest_then_content_satisfies_without_echo() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let b = stream_face(&mut f);
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        let content = content_msg("/x/y/1", b"payload");
        f.handle_input(b, &content, 0).unwrap();

        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a), vec![content]);
        assert!(f.take_sendq(b).is_empty());
        assert!(f
            .interests
            .propagating_for_prefix(&key_of("/x/y"))
            .iter()
            .all(|&s| f.interests.propagating(s).unwrap().consumed));
    }

    #[test]
    fn duplicate_nonce_is_suppressed() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let b = stream_face(&mut f);
        let interest = Interest::new(Name::from_uri("/x/y"))
            .with_nonce(vec![1, 2, 3, 4, 5, 6])
            .encode();
        f.handle_input(a, &interest, 0).unwrap();
        run_until(&mut f, 100_000);
        assert_eq!(f.take_sendq(b).len(), 1);

        // The same nonce looping back produces nothing new.
        f.handle_input(b, &interest, 100_000).unwrap();
        assert_eq!(f.stats.duplicate_nonces, 1);
        assert_eq!(f.interests.propagating_count(), 1);
        run_until(&mut f, 7_000_000);
        assert!(f.take_sendq(a).is_empty());
        assert!(f.take_sendq(b).is_empty());
    }

    #[test]
    fn rightmost_preference_returns_largest_match() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        for i in 1..=3 {
            f.handle_input(b, &content_msg(&format!("/x/a/{i}"), b"p"), 0)
                .unwrap();
        }
        let interest = Interest::new(Name::from_uri("/x/a"))
            .with_order_preference(ORDER_PREF_RIGHTMOST)
            .encode();
        f.handle_input(a, &interest, 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a), vec![content_msg("/x/a/3", b"p")]);
    }

    #[test]
    fn explicit_digest_component_matches_exact_object() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let content = content_msg("/x/y/1", b"payload");
        f.handle_input(b, &content, 0).unwrap();

        let mut name = Name::from_uri("/x/y/1");
        name.push_digest(ContentObject::implicit_digest(&content));
        f.handle_input(a, &Interest::new(name).encode(), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a), vec![content]);
    }

    #[test]
    fn wrong_digest_component_does_not_match() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        f.handle_input(b, &content_msg("/x/y/1", b"payload"), 0)
            .unwrap();
        let mut name = Name::from_uri("/x/y/1");
        name.push_digest([0xEE; 32]);
        f.handle_input(a, &Interest::new(name).encode(), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert!(f.take_sendq(a).is_empty());
    }

    #[test]
    fn content_is_sent_at_most_once_per_burst() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let b = stream_face(&mut f);
        // Two live subscriptions from the same face, distinct nonces.
        f.handle_input(
            a,
            &Interest::new(Name::from_uri("/x/y"))
                .with_nonce(vec![1; 6])
                .encode(),
            0,
        )
        .unwrap();
        f.handle_input(
            a,
            &Interest::new(Name::from_uri("/x/y"))
                .with_nonce(vec![2; 6])
                .encode(),
            0,
        )
        .unwrap();
        f.handle_input(b, &content_msg("/x/y/1", b"p"), 0).unwrap();
        run_until(&mut f, 2_000_000);
        assert_eq!(f.take_sendq(a).len(), 1);
    }

    #[test]
    fn unsolicited_content_is_flagged_slow() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        f.handle_input(b, &content_msg("/x/y/1", b"p"), 0).unwrap();
        let acc = f.store.accessions()[0];
        let entry = f.store.entry(acc).unwrap();
        assert!(entry.flags & content_flags::SLOW_SEND != 0);
    }

    #[test]
    fn solicited_content_is_not_flagged_slow() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let b = stream_face(&mut f);
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        f.handle_input(b, &content_msg("/x/y/1", b"p"), 0).unwrap();
        let acc = f.store.accessions()[0];
        assert_eq!(f.store.entry(acc).unwrap().flags & content_flags::SLOW_SEND, 0);
    }

    #[test]
    fn scope_zero_interest_does_not_propagate() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let _b = stream_face(&mut f);
        let interest = Interest::new(Name::from_uri("/x/y")).with_scope(0).encode();
        f.handle_input(a, &interest, 0).unwrap();
        let slot = f.interests.propagating_for_prefix(&key_of("/x/y"))[0];
        assert!(f.interests.propagating(slot).unwrap().outbound.is_empty());
    }

    #[test]
    fn scope_one_skips_link_faces() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let link = f.create_face(flags::DGRAM | flags::LINK, None, 0).unwrap();
        let local = stream_face(&mut f);
        let interest = Interest::new(Name::from_uri("/x/y")).with_scope(1).encode();
        f.handle_input(a, &interest, 0).unwrap();
        let slot = f.interests.propagating_for_prefix(&key_of("/x/y"))[0];
        let outbound = &f.interests.propagating(slot).unwrap().outbound;
        assert!(outbound.contains(&local));
        assert!(!outbound.contains(&link));
        assert!(!outbound.contains(&a));
    }

    #[test]
    fn limited_scope_interest_from_link_face_is_dropped() {
        let mut f = fwd();
        let link = f.create_face(flags::DGRAM | flags::LINK, None, 0).unwrap();
        let interest = Interest::new(Name::from_uri("/x/y")).with_scope(1).encode();
        f.handle_input(link, &interest, 0).unwrap();
        assert_eq!(f.stats.interests_dropped, 1);
        assert!(f.interests.prefix(&key_of("/x/y")).is_none());
    }

    #[test]
    fn envelope_marks_face_link_framed_and_replies_are_wrapped() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let content = content_msg("/x/y/1", b"p");
        f.handle_input(b, &content, 0).unwrap();

        let wrapped = ccn_transport::framing::wrap_in_envelope(&interest_msg("/x/y"));
        f.handle_input(a, &wrapped, 0).unwrap();
        assert!(f.faces.lookup(a).unwrap().is_link());

        run_until(&mut f, 1_000_000);
        let out = f.take_sendq(a);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], ccn_transport::framing::wrap_in_envelope(&content));
    }

    #[test]
    fn short_term_blocking_suppresses_refetch() {
        let mut f = fwd_blocking();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let content = content_msg("/x/y/1", b"p");
        f.handle_input(b, &content, 0).unwrap();
        f.handle_input(
            a,
            &Interest::new(Name::from_uri("/x/y")).with_nonce(vec![1; 6]).encode(),
            0,
        )
        .unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a).len(), 1);

        // Same question again without a response filter: blocked, so
        // it goes to the interest table instead.
        f.faces.lookup_mut(a).unwrap().cached_accession = None;
        f.handle_input(
            a,
            &Interest::new(Name::from_uri("/x/y")).with_nonce(vec![2; 6]).encode(),
            1_000_000,
        )
        .unwrap();
        run_until(&mut f, 2_000_000);
        assert!(f.take_sendq(a).is_empty());
        assert!(f.interests.prefix(&key_of("/x/y")).is_some());
    }

    #[test]
    fn response_filter_skips_seen_content_and_clears_mark() {
        let mut f = fwd_blocking();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let content = content_msg("/x/y/1", b"p");
        f.handle_input(b, &content, 0).unwrap();
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a).len(), 1);

        let acc = f.store.accessions()[0];
        let digest = f.store.entry(acc).unwrap().signature_digest().unwrap();

        // Filter naming the digest: nothing comes back.
        let mut interest = Interest::new(Name::from_uri("/x/y")).with_nonce(vec![3; 6]);
        let mut seen = ccn_core::Bloom::new(10, 4);
        seen.insert(&digest);
        interest.response_filter = Some(seen);
        f.faces.lookup_mut(a).unwrap().cached_accession = None;
        f.handle_input(a, &interest.encode(), 1_000_000).unwrap();
        run_until(&mut f, 2_000_000);
        assert!(f.take_sendq(a).is_empty());

        // An empty filter says "not seen": the mark clears and the
        // content is resent despite blocking.
        let mut interest = Interest::new(Name::from_uri("/x/y")).with_nonce(vec![4; 6]);
        interest.response_filter = Some(ccn_core::Bloom::new(10, 4));
        f.faces.lookup_mut(a).unwrap().cached_accession = None;
        f.handle_input(a, &interest.encode(), 2_000_000).unwrap();
        run_until(&mut f, 3_000_000);
        assert_eq!(f.take_sendq(a).len(), 1);
    }

    #[test]
    fn enumeration_resumes_past_cached_accession() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        f.handle_input(b, &content_msg("/x/y/1", b"p"), 0).unwrap();
        f.handle_input(b, &content_msg("/x/y/2", b"p"), 0).unwrap();

        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a), vec![content_msg("/x/y/1", b"p")]);

        f.handle_input(a, &interest_msg("/x/y"), 1_000_000).unwrap();
        run_until(&mut f, 2_000_000);
        assert_eq!(f.take_sendq(a), vec![content_msg("/x/y/2", b"p")]);
    }

    #[test]
    fn name_collision_drops_both_and_no_delivery() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        f.handle_input(b, &content_msg("/x/y", b"one"), 0).unwrap();
        f.handle_input(b, &content_msg("/x/y", b"two"), 0).unwrap();
        assert_eq!(f.stats.content_collisions, 1);
        assert!(f.store.is_empty());

        let mut interest = Interest::new(Name::from_uri("/x"));
        interest.min_suffix_components = Some(0);
        f.handle_input(a, &interest.encode(), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert!(f.take_sendq(a).is_empty());
    }

    #[test]
    fn cleaning_compacts_dead_faces() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        f.start(0);
        let content = content_msg("/x/y/1", b"p");
        f.handle_input(b, &content, 0).unwrap();
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        run_until(&mut f, 1_000_000);
        assert_eq!(f.take_sendq(a).len(), 1);

        f.destroy_face(a);
        f.destroy_face(b);
        run_until(&mut f, CLEAN_PERIOD_MICROS + 1_000_000);
        let acc = f.store.accessions()[0];
        let entry = f.store.entry(acc).unwrap();
        assert!(entry.faces.is_empty());
        assert_eq!(entry.nface_done, 0);
        assert_eq!(entry.nface_old, 0);
    }

    #[test]
    fn reaper_collects_idle_datagram_faces() {
        let mut f = fwd();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let d = f.datagram_face(addr, 0).unwrap();
        assert!(f.faces.lookup(d).is_some());
        // Two quiet sweeps take it down.
        run_until(&mut f, 3 * REAP_PERIOD_MICROS);
        assert!(f.faces.lookup(d).is_none());
        assert_eq!(f.faces.datagram_face(&addr), None);
    }

    #[test]
    fn active_datagram_face_survives_the_reaper() {
        let mut f = fwd();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let d = f.datagram_face(addr, 0).unwrap();
        run_until(&mut f, REAP_PERIOD_MICROS + 1);
        // Activity between sweeps clears the mark.
        f.handle_input(d, &interest_msg("/x"), REAP_PERIOD_MICROS + 2)
            .unwrap();
        run_until(&mut f, 2 * REAP_PERIOD_MICROS + 1);
        assert!(f.faces.lookup(d).is_some());
    }

    #[test]
    fn pacing_follows_the_upcoming_target_face() {
        let mut f = fwd();
        let b = stream_face(&mut f);
        let a = stream_face(&mut f);
        let link = f.create_face(flags::DGRAM | flags::LINK, None, 0).unwrap();
        let content = content_msg("/x/y/1", b"p");
        f.handle_input(b, &content, 0).unwrap();
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        f.handle_input(link, &interest_msg("/x/y"), 0).unwrap();

        // The local stream face answers almost at once; the delay
        // before the link-framed copy is the link pause, not the
        // stream face's ten microseconds.
        run_until(&mut f, 5_000);
        assert_eq!(f.take_sendq(a).len(), 1);
        assert!(f.take_sendq(link).is_empty());
        run_until(&mut f, 200_000);
        assert_eq!(f.take_sendq(link).len(), 1);
    }

    #[test]
    fn one_byte_datagram_is_a_heartbeat() {
        let mut f = fwd();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let d = f.datagram_face(addr, 0).unwrap();
        assert!(f.handle_input(d, &[0], 0).is_ok());
        assert_eq!(f.stats.parse_errors, 0);
        let face = f.faces.lookup(d).unwrap();
        assert_eq!(face.recvcount, 1);
        assert_eq!(face.framer.buffered(), 0);
    }

    #[test]
    fn datagram_idle_sweeps_is_configurable() {
        let mut f = Forwarder::new(
            1,
            ForwarderOptions {
                datagram_idle_sweeps: 1,
                ..Default::default()
            },
        );
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let d = f.datagram_face(addr, 0).unwrap();
        // A single quiet sweep suffices at this setting.
        run_until(&mut f, REAP_PERIOD_MICROS + 1);
        assert!(f.faces.lookup(d).is_none());
    }

    #[test]
    fn matched_demand_is_consumed() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        let b = stream_face(&mut f);
        f.handle_input(a, &interest_msg("/x/y"), 0).unwrap();
        assert_eq!(
            f.interests.prefix(&key_of("/x/y")).unwrap().counters,
            vec![UNIT_DEMAND]
        );
        f.handle_input(b, &content_msg("/x/y/1", b"p"), 0).unwrap();
        assert_eq!(f.interests.prefix(&key_of("/x/y")).unwrap().counters, vec![0]);
    }

    #[test]
    fn stream_framing_error_reported_for_teardown() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        assert!(f.handle_input(a, &[0x33, 1, 0], 0).is_err());
    }

    #[test]
    fn datagram_framing_error_discards_buffer() {
        let mut f = fwd();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let d = f.datagram_face(addr, 0).unwrap();
        assert!(f.handle_input(d, &[0x33, 1, 0], 0).is_ok());
        assert!(f.faces.lookup(d).is_some());
        // The face keeps working afterwards.
        assert!(f.handle_input(d, &interest_msg("/x"), 1).is_ok());
        assert_eq!(f.stats.interests_received, 1);
    }

    #[test]
    fn malformed_message_on_stream_keeps_face_alive() {
        let mut f = fwd();
        let a = stream_face(&mut f);
        // Well-framed but undecodable interest: dropped, face lives.
        let bogus = ccn_core::TlvElement::new(types::INTEREST, vec![0xFF, 0x01]).encode();
        assert!(f.handle_input(a, &bogus, 0).is_ok());
        assert_eq!(f.stats.parse_errors, 1);
        f.handle_input(a, &interest_msg("/x"), 1).unwrap();
        assert_eq!(f.stats.interests_received, 2);
    }
}
