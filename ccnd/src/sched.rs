//! The timed task engine.
//!
//! Tasks fire in deadline order; equal deadlines fire in insertion
//! order. There is no explicit cancel operation: the owner of a task
//! keeps the [`TaskToken`] it got at scheduling time and clears it to
//! cancel; when the event fires, the dispatcher compares the event's
//! token against the owner's and drops mismatches.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Identity of one scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(u64);

/// What to do when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Decay interest demand counters.
    AgeDemand,
    /// Sweep inactive datagram faces and drained propagating entries.
    Reap,
    /// Compact content face-send sets.
    Clean,
    /// Send a content entry to its next pending face.
    SendContent { accession: u64 },
    /// Forward a propagating interest to its next outbound face.
    PropagateInterest { slot: usize },
}

#[derive(Debug, PartialEq, Eq)]
struct Event {
    due: u64,
    seq: u64,
    token: TaskToken,
    kind: TaskKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered event queue over a microsecond clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
    next_token: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` to fire `delay_us` after `now_us`.
    pub fn schedule(&mut self, now_us: u64, delay_us: u64, kind: TaskKind) -> TaskToken {
        let token = TaskToken(self.next_token);
        self.next_token += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Event {
            due: now_us.saturating_add(delay_us),
            seq,
            token,
            kind,
        }));
        token
    }

    /// Deadline of the earliest event, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.due)
    }

    /// Pop the earliest event if it is due at `now_us`.
    pub fn pop_due(&mut self, now_us: u64) -> Option<(TaskToken, TaskKind)> {
        if self.heap.peek().map(|Reverse(e)| e.due <= now_us) == Some(true) {
            let Reverse(e) = self.heap.pop().unwrap();
            Some((e.token, e.kind))
        } else {
            None
        }
    }
}
